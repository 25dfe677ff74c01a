use anyhow::{Result, anyhow};

/// One video frame in packed RGB order. For replayed detection logs (where
/// no pixel data is available) `data` may be empty; only the pixel-count
/// strategy requires actual image content.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: f64,
}

impl Frame {
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32, timestamp: f64) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(anyhow!(
                "RGB buffer size {} does not match {}x{} frame (expected {})",
                data.len(),
                width,
                height,
                expected
            ));
        }
        Ok(Frame {
            data,
            width,
            height,
            timestamp,
        })
    }

    /// A frame carrying only dimensions and timestamp (detection replay).
    pub fn dimensions_only(width: u32, height: u32, timestamp: f64) -> Self {
        Frame {
            data: Vec::new(),
            width,
            height,
            timestamp,
        }
    }

    pub fn has_pixels(&self) -> bool {
        self.data.len() == self.width as usize * self.height as usize * 3
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn to_gray(&self) -> Result<GrayImage> {
        if !self.has_pixels() {
            return Err(anyhow!("frame carries no pixel data"));
        }
        let width = self.width as usize;
        let height = self.height as usize;
        let mut data = Vec::with_capacity(width * height);
        for px in self.data.chunks_exact(3) {
            // ITU-R BT.601 luma weights
            let luma = 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
            data.push(luma.round().min(255.) as u8);
        }
        Ok(GrayImage {
            data,
            width,
            height,
        })
    }
}

/// Single-channel 8-bit image, the working format of the
/// foreground-extraction pipeline.
#[derive(Debug, Clone)]
pub struct GrayImage {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
}

impl GrayImage {
    pub fn new(width: usize, height: usize) -> Self {
        GrayImage {
            data: vec![0; width * height],
            width,
            height,
        }
    }

    pub fn from_fn(width: usize, height: usize, f: impl Fn(usize, usize) -> u8) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        GrayImage {
            data,
            width,
            height,
        }
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }

    /// Read with edge replication, for windowed filters near borders.
    #[inline]
    pub fn get_clamped(&self, x: isize, y: isize) -> u8 {
        let x = x.clamp(0, self.width as isize - 1) as usize;
        let y = y.clamp(0, self.height as isize - 1) as usize;
        self.get(x, y)
    }

    pub fn mean_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.;
        }
        let sum: u64 = self.data.iter().map(|&v| v as u64).sum();
        sum as f32 / self.data.len() as f32
    }

    /// Standard deviation of pixel values, used as a contrast measure.
    pub fn contrast(&self) -> f32 {
        if self.data.is_empty() {
            return 0.;
        }
        let mean = self.mean_brightness();
        let var: f32 = self
            .data
            .iter()
            .map(|&v| {
                let d = v as f32 - mean;
                d * d
            })
            .sum::<f32>()
            / self.data.len() as f32;
        var.sqrt()
    }
}
