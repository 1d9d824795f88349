use image::imageops::{self, FilterType};
use image::DynamicImage;
use ndarray::Array4;

use crate::model::InputTensor;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Turns a decoded image into the model's normalized NCHW input.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    size: u32,
    mean: [f32; 3],
    std: [f32; 3],
}

impl Preprocessor {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }

    pub fn input_shape(&self) -> [usize; 4] {
        [1, 3, self.size as usize, self.size as usize]
    }

    pub fn preprocess(&self, image: &DynamicImage) -> InputTensor {
        let rgb = image.to_rgb8();
        let resized = imageops::resize(&rgb, self.size, self.size, FilterType::Triangle);

        let mut tensor = Array4::<f32>::zeros(self.input_shape());
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                let value = pixel[c] as f32 / 255.0;
                tensor[[0, c, y as usize, x as usize]] = (value - self.mean[c]) / self.std[c];
            }
        }
        tensor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage, Rgba, RgbaImage};

    #[test]
    fn output_matches_declared_shape_for_any_input_size() {
        let preprocessor = Preprocessor::new(320);
        for (w, h) in [(10, 10), (1, 500), (640, 480), (320, 320)] {
            let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([120, 80, 200])));
            let tensor = preprocessor.preprocess(&image);
            assert_eq!(tensor.shape(), &[1, 3, 320, 320]);
            assert!(tensor.is_standard_layout());
        }
    }

    #[test]
    fn grayscale_and_alpha_become_three_channels() {
        let preprocessor = Preprocessor::new(32);
        let gray = DynamicImage::ImageLuma8(GrayImage::from_pixel(8, 8, Luma([128])));
        let rgba = DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 8, Rgba([10, 20, 30, 0])));
        assert_eq!(preprocessor.preprocess(&gray).shape(), &[1, 3, 32, 32]);
        assert_eq!(preprocessor.preprocess(&rgba).shape(), &[1, 3, 32, 32]);
    }

    #[test]
    fn applies_imagenet_normalization() {
        let preprocessor = Preprocessor::new(4);
        let white = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([255, 255, 255])));
        let tensor = preprocessor.preprocess(&white);
        for c in 0..3 {
            let expected = (1.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
            assert!((tensor[[0, c, 2, 2]] - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn is_deterministic() {
        let preprocessor = Preprocessor::new(64);
        let image = DynamicImage::ImageRgb8(RgbImage::from_fn(17, 23, |x, y| {
            Rgb([(x * 7) as u8, (y * 11) as u8, ((x + y) * 3) as u8])
        }));
        assert_eq!(preprocessor.preprocess(&image), preprocessor.preprocess(&image));
    }
}
