use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 8-bit RGB, as read back from a GL framebuffer.
    Rgb24,
    Rgba,
    Bgra,
    /// Planar Y, U, V with 2x2 subsampled chroma.
    I420,
}

impl PixelFormat {
    /// Size in bytes of a tightly packed frame of this format.
    pub fn bytes_per_frame(&self, width: usize, height: usize) -> usize {
        match self {
            Self::Rgb24 => width * height * 3,
            Self::Rgba | Self::Bgra => width * height * 4,
            Self::I420 => width * height + 2 * chroma_len(width, height),
        }
    }
}

fn chroma_len(width: usize, height: usize) -> usize {
    ((width + 1) / 2) * ((height + 1) / 2)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: usize,
    pub height: usize,
}

impl Resolution {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }
}

/// Opaque handle to a GPU-resident buffer owned by the renderer (texture name,
/// pixel buffer object or device pointer, depending on the backend).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeHandle(pub u64);

#[derive(Debug, Clone)]
pub enum FrameData {
    Cpu(Bytes),
    Native(NativeHandle),
}

/// One raw frame handed over by the renderer.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: usize,
    pub height: usize,
    pub format: PixelFormat,
    /// Capture time on the renderer's monotonic clock.
    pub timestamp_us: i64,
    pub data: FrameData,
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum FrameError {
    #[error("frame has {actual} bytes, {expected} expected for {width}x{height} {format:?}")]
    WrongSize {
        width: usize,
        height: usize,
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
    #[error("frame dimensions must be non-zero")]
    Empty,
    #[error("frame is GPU-resident and cannot be converted on the CPU")]
    NotCpuResident,
}

impl RawFrame {
    pub fn cpu(
        width: usize,
        height: usize,
        format: PixelFormat,
        timestamp_us: i64,
        data: Bytes,
    ) -> Self {
        Self {
            width,
            height,
            format,
            timestamp_us,
            data: FrameData::Cpu(data),
        }
    }

    pub fn native(
        width: usize,
        height: usize,
        format: PixelFormat,
        timestamp_us: i64,
        handle: NativeHandle,
    ) -> Self {
        Self {
            width,
            height,
            format,
            timestamp_us,
            data: FrameData::Native(handle),
        }
    }

    /// Copy borrowed renderer pixels into an owned frame. The renderer keeps
    /// ownership of `pixels`; nothing references it after this returns.
    pub fn copy_from_slice(
        pixels: &[u8],
        width: usize,
        height: usize,
        format: PixelFormat,
        timestamp_us: i64,
    ) -> Result<Self, FrameError> {
        let frame = Self::cpu(
            width,
            height,
            format,
            timestamp_us,
            Bytes::copy_from_slice(pixels),
        );
        frame.validate()?;
        Ok(frame)
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    pub fn validate(&self) -> Result<(), FrameError> {
        if self.width == 0 || self.height == 0 {
            return Err(FrameError::Empty);
        }
        if let FrameData::Cpu(data) = &self.data {
            let expected = self.format.bytes_per_frame(self.width, self.height);
            if data.len() != expected {
                return Err(FrameError::WrongSize {
                    width: self.width,
                    height: self.height,
                    format: self.format,
                    expected,
                    actual: data.len(),
                });
            }
        }
        Ok(())
    }

    /// Convert the provided frame to I420.
    pub fn to_i420(&self) -> Result<I420Frame, FrameError> {
        self.validate()?;
        let FrameData::Cpu(data) = &self.data else {
            return Err(FrameError::NotCpuResident);
        };

        match self.format {
            PixelFormat::I420 => Ok(I420Frame::from_planar(self.width, self.height, data)),
            PixelFormat::Rgb24 => Ok(packed_to_i420(self.width, self.height, data, 3, [0, 1, 2])),
            PixelFormat::Rgba => Ok(packed_to_i420(self.width, self.height, data, 4, [0, 1, 2])),
            PixelFormat::Bgra => Ok(packed_to_i420(self.width, self.height, data, 4, [2, 1, 0])),
        }
    }
}

/// Planar 4:2:0 frame with tightly packed planes.
#[derive(Debug, Clone, PartialEq)]
pub struct I420Frame {
    pub width: usize,
    pub height: usize,
    pub y: Vec<u8>,
    pub u: Vec<u8>,
    pub v: Vec<u8>,
}

impl I420Frame {
    pub fn new(width: usize, height: usize) -> Self {
        let chroma = chroma_len(width, height);
        Self {
            width,
            height,
            y: vec![0; width * height],
            u: vec![128; chroma],
            v: vec![128; chroma],
        }
    }

    fn from_planar(width: usize, height: usize, data: &[u8]) -> Self {
        let luma = width * height;
        let chroma = chroma_len(width, height);
        Self {
            width,
            height,
            y: data[..luma].to_vec(),
            u: data[luma..luma + chroma].to_vec(),
            v: data[luma + chroma..luma + 2 * chroma].to_vec(),
        }
    }

    pub fn chroma_width(&self) -> usize {
        (self.width + 1) / 2
    }

    pub fn chroma_height(&self) -> usize {
        (self.height + 1) / 2
    }

    /// Overwrite this frame's planes with `other`, scaling when the sizes differ.
    pub fn fill_from(&mut self, other: &I420Frame) {
        if other.width == self.width && other.height == self.height {
            self.y.copy_from_slice(&other.y);
            self.u.copy_from_slice(&other.u);
            self.v.copy_from_slice(&other.v);
        } else {
            *self = other.scale_to(self.width, self.height);
        }
    }

    /// Bilinear rescale of every plane.
    pub fn scale_to(&self, width: usize, height: usize) -> I420Frame {
        let mut out = I420Frame::new(width, height);
        let (cw, ch) = (out.chroma_width(), out.chroma_height());
        scale_plane(&self.y, self.width, self.height, &mut out.y, width, height);
        scale_plane(&self.u, self.chroma_width(), self.chroma_height(), &mut out.u, cw, ch);
        scale_plane(&self.v, self.chroma_width(), self.chroma_height(), &mut out.v, cw, ch);
        out
    }

    /// Planes concatenated as Y, U, V.
    pub fn to_bytes(&self) -> Bytes {
        let mut data = Vec::with_capacity(self.y.len() + self.u.len() + self.v.len());
        data.extend_from_slice(&self.y);
        data.extend_from_slice(&self.u);
        data.extend_from_slice(&self.v);
        Bytes::from(data)
    }
}

fn packed_to_i420(
    width: usize,
    height: usize,
    data: &[u8],
    bpp: usize,
    [r_at, g_at, b_at]: [usize; 3],
) -> I420Frame {
    let mut out = I420Frame::new(width, height);
    let stride = width * bpp;
    let cw = out.chroma_width();

    for row in 0..height {
        for col in 0..width {
            let px = &data[row * stride + col * bpp..];
            let (r, g, b) = (px[r_at] as i32, px[g_at] as i32, px[b_at] as i32);
            out.y[row * width + col] = (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16) as u8;
        }
    }

    for crow in 0..out.chroma_height() {
        for ccol in 0..cw {
            let (mut r, mut g, mut b, mut n) = (0i32, 0i32, 0i32, 0i32);
            for row in (crow * 2)..(crow * 2 + 2).min(height) {
                for col in (ccol * 2)..(ccol * 2 + 2).min(width) {
                    let px = &data[row * stride + col * bpp..];
                    r += px[r_at] as i32;
                    g += px[g_at] as i32;
                    b += px[b_at] as i32;
                    n += 1;
                }
            }
            let (r, g, b) = (r / n, g / n, b / n);
            out.u[crow * cw + ccol] = (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128) as u8;
            out.v[crow * cw + ccol] = (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128) as u8;
        }
    }

    out
}

fn scale_plane(src: &[u8], sw: usize, sh: usize, dst: &mut [u8], dw: usize, dh: usize) {
    if sw == 0 || sh == 0 || dw == 0 || dh == 0 {
        return;
    }
    // 16.16 fixed point source coordinates, pixel-centre aligned.
    let x_step = ((sw as u64) << 16) / dw as u64;
    let y_step = ((sh as u64) << 16) / dh as u64;

    for dy in 0..dh {
        let fy = ((dy as u64 * y_step) + (y_step >> 1)).saturating_sub(1 << 15);
        let y0 = ((fy >> 16) as usize).min(sh - 1);
        let y1 = (y0 + 1).min(sh - 1);
        let wy = (fy & 0xffff) as u32;

        for dx in 0..dw {
            let fx = ((dx as u64 * x_step) + (x_step >> 1)).saturating_sub(1 << 15);
            let x0 = ((fx >> 16) as usize).min(sw - 1);
            let x1 = (x0 + 1).min(sw - 1);
            let wx = (fx & 0xffff) as u32;

            let top = lerp(src[y0 * sw + x0], src[y0 * sw + x1], wx);
            let bottom = lerp(src[y1 * sw + x0], src[y1 * sw + x1], wx);
            dst[dy * dw + dx] = lerp(top, bottom, wy);
        }
    }
}

fn lerp(a: u8, b: u8, w: u32) -> u8 {
    ((a as u32 * (0x10000 - w) + b as u32 * w + 0x8000) >> 16) as u8
}
