use std::marker::PhantomData;

use image::DynamicImage;
use log::trace;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Bgr24,
    Bgr32,
    Bgra32,
    PremultipliedBgra32,
    Indexed1,
    Indexed4,
    Indexed8,
    Gray16,
    Bgr48,
    Other,
}

impl PixelFormat {
    pub fn channel_count(self) -> u32 {
        match self {
            PixelFormat::Bgr24 => 3,
            PixelFormat::Bgr32 | PixelFormat::Bgra32 | PixelFormat::PremultipliedBgra32 => 4,
            PixelFormat::Indexed1 | PixelFormat::Indexed4 | PixelFormat::Indexed8 => 1,
            _ => 3,
        }
    }
}

/// Pixel memory in the row layout the engine reads: rows of `stride` bytes,
/// channels in BGR(A) order.
#[derive(Debug, Clone)]
pub struct Bitmap {
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
    data: Vec<u8>,
}

impl Bitmap {
    pub fn from_raw(
        width: u32,
        height: u32,
        stride: u32,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> Result<Bitmap> {
        check_layout(data.len(), width, height, stride, format.channel_count())?;

        Ok(Bitmap {
            width,
            height,
            stride,
            format,
            data,
        })
    }

    /// Converts any image to 24-bit BGR with rows padded to four bytes.
    pub fn from_image(image: &DynamicImage) -> Bitmap {
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();
        let stride = (width * 3 + 3) & !3;
        let mut data = vec![0u8; stride as usize * height as usize];

        for (x, y, pixel) in rgb.enumerate_pixels() {
            let offset = y as usize * stride as usize + x as usize * 3;
            let [r, g, b] = pixel.0;

            data[offset] = b;
            data[offset + 1] = g;
            data[offset + 2] = r;
        }

        Bitmap {
            width,
            height,
            stride,
            format: PixelFormat::Bgr24,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Pins the pixel memory for one native call. The lock is released when
    /// the returned buffer is dropped.
    pub fn lock(&mut self) -> PixelBuffer<'_> {
        trace!("locking {}x{} bitmap", self.width, self.height);

        PixelBuffer {
            ptr: self.data.as_mut_ptr(),
            width: self.width,
            height: self.height,
            stride: self.stride,
            channel_count: self.format.channel_count(),
            _pixels: PhantomData,
        }
    }
}

/// Borrowed view of pixel memory, handed to the engine as
/// `(ptr, width, height, stride, channel_count)`.
#[derive(Debug)]
pub struct PixelBuffer<'a> {
    ptr: *mut u8,
    width: u32,
    height: u32,
    stride: u32,
    channel_count: u32,
    _pixels: PhantomData<&'a mut [u8]>,
}

impl<'a> PixelBuffer<'a> {
    pub fn new(
        pixels: &'a mut [u8],
        width: u32,
        height: u32,
        stride: u32,
        channel_count: u32,
    ) -> Result<PixelBuffer<'a>> {
        check_layout(pixels.len(), width, height, stride, channel_count)?;

        Ok(PixelBuffer {
            ptr: pixels.as_mut_ptr(),
            width,
            height,
            stride,
            channel_count,
            _pixels: PhantomData,
        })
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn channel_count(&self) -> u32 {
        self.channel_count
    }
}

impl Drop for PixelBuffer<'_> {
    fn drop(&mut self) {
        trace!("unlocking {}x{} pixel buffer", self.width, self.height);
    }
}

/// Rejects layouts the engine would read past: every row must hold
/// `width * channel_count` bytes and the memory must hold `height` rows.
fn check_layout(len: usize, width: u32, height: u32, stride: u32, channel_count: u32) -> Result<()> {
    let row = width as u64 * channel_count as u64;

    if width == 0
        || height == 0
        || channel_count == 0
        || (stride as u64) < row
        || (len as u64) < stride as u64 * height as u64
    {
        return Err(Error::PixelBuffer {
            width,
            height,
            stride,
            channel_count,
            len,
        });
    }

    Ok(())
}

#[test]
fn channel_count_test() {
    assert_eq!(PixelFormat::Bgr24.channel_count(), 3);
    assert_eq!(PixelFormat::Bgr32.channel_count(), 4);
    assert_eq!(PixelFormat::Bgra32.channel_count(), 4);
    assert_eq!(PixelFormat::PremultipliedBgra32.channel_count(), 4);
    assert_eq!(PixelFormat::Indexed1.channel_count(), 1);
    assert_eq!(PixelFormat::Indexed4.channel_count(), 1);
    assert_eq!(PixelFormat::Indexed8.channel_count(), 1);
    assert_eq!(PixelFormat::Gray16.channel_count(), 3);
    assert_eq!(PixelFormat::Bgr48.channel_count(), 3);
    assert_eq!(PixelFormat::Other.channel_count(), 3);
}

#[test]
fn from_image_test() {
    use image::{Rgb, RgbImage};

    let mut image = RgbImage::new(5, 2);
    image.put_pixel(0, 0, Rgb([10, 20, 30]));
    image.put_pixel(4, 1, Rgb([1, 2, 3]));

    let mut bitmap = Bitmap::from_image(&DynamicImage::ImageRgb8(image));

    assert_eq!(bitmap.width(), 5);
    assert_eq!(bitmap.height(), 2);
    assert_eq!(bitmap.stride(), 16);
    assert_eq!(bitmap.format(), PixelFormat::Bgr24);
    assert_eq!(&bitmap.data[0..3], &[30, 20, 10]);
    assert_eq!(&bitmap.data[16 + 12..16 + 15], &[3, 2, 1]);

    let buffer = bitmap.lock();

    assert_eq!(buffer.channel_count(), 3);
    assert_eq!(buffer.stride(), 16);
}

#[test]
fn pixel_buffer_too_small_test() {
    let mut pixels = vec![0u8; 10];

    assert!(matches!(
        PixelBuffer::new(&mut pixels, 4, 3, 4, 1),
        Err(Error::PixelBuffer {
            len: 10,
            stride: 4,
            height: 3,
            ..
        })
    ));
    assert!(PixelBuffer::new(&mut pixels, 3, 2, 5, 1).is_ok());
    assert!(Bitmap::from_raw(2, 2, 8, PixelFormat::Bgra32, vec![0; 15]).is_err());
}

#[test]
fn pixel_buffer_short_stride_test() {
    let mut pixels = vec![0u8; 6];

    assert!(matches!(
        PixelBuffer::new(&mut pixels, 100, 2, 3, 3),
        Err(Error::PixelBuffer {
            width: 100,
            stride: 3,
            channel_count: 3,
            ..
        })
    ));
    assert!(PixelBuffer::new(&mut pixels, 2, 2, 3, 1).is_ok());
    assert!(PixelBuffer::new(&mut pixels, 1, 2, 3, 3).is_ok());
    assert!(PixelBuffer::new(&mut pixels, 2, 2, 3, 3).is_err());

    assert!(Bitmap::from_raw(3, 2, 8, PixelFormat::Bgr24, vec![0; 16]).is_err());
    assert!(Bitmap::from_raw(3, 2, 9, PixelFormat::Bgr24, vec![0; 18]).is_ok());
    assert!(Bitmap::from_raw(3, 2, 12, PixelFormat::Bgr32, vec![0; 24]).is_ok());
    assert!(Bitmap::from_raw(3, 2, 11, PixelFormat::Bgr32, vec![0; 24]).is_err());
}

#[test]
fn pixel_buffer_degenerate_test() {
    let mut pixels = vec![0u8; 16];

    assert!(PixelBuffer::new(&mut pixels, 0, 2, 4, 1).is_err());
    assert!(PixelBuffer::new(&mut pixels, 2, 0, 4, 1).is_err());
    assert!(PixelBuffer::new(&mut pixels, 2, 2, 4, 0).is_err());
    assert!(Bitmap::from_raw(0, 0, 0, PixelFormat::Indexed8, Vec::new()).is_err());
}
