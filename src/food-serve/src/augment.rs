use image::{Rgb, RgbImage};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

/// Augmentation and preprocessing constants.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AugmentationConfig {
    /// Factor applied to raw `u8` channel values
    pub rescale: f32,
    /// Maximum rotation, in degrees (applies +/- rotation_range)
    pub rotation_range: f32,
    /// Maximum horizontal shift as a fraction of the width
    pub width_shift_range: f32,
    /// Maximum vertical shift as a fraction of the height
    pub height_shift_range: f32,
    /// Maximum shear angle, in degrees
    pub shear_range: f32,
    /// Zoom factors are drawn from `[1 - zoom_range, 1 + zoom_range]`
    pub zoom_range: f32,
    /// Flip half of the images horizontally
    pub horizontal_flip: bool,
    /// Fraction of every class held out for validation
    pub validation_split: f64,
}

impl AugmentationConfig {
    /// Settings used to train the food classifier.
    pub const FOOD101: AugmentationConfig = AugmentationConfig {
        rescale: 1.0 / 255.0,
        rotation_range: 30.0,
        width_shift_range: 0.2,
        height_shift_range: 0.2,
        shear_range: 0.2,
        zoom_range: 0.2,
        horizontal_flip: true,
        validation_split: 0.2,
    };

    /// Same preprocessing and split, without random transforms.
    pub fn without_transforms(&self) -> Self {
        AugmentationConfig {
            rotation_range: 0.0,
            width_shift_range: 0.0,
            height_shift_range: 0.0,
            shear_range: 0.0,
            zoom_range: 0.0,
            horizontal_flip: false,
            ..*self
        }
    }

    fn is_identity(&self) -> bool {
        self.rotation_range == 0.0
            && self.width_shift_range == 0.0
            && self.height_shift_range == 0.0
            && self.shear_range == 0.0
            && self.zoom_range == 0.0
            && !self.horizontal_flip
    }
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self::FOOD101
    }
}

/// Source coordinate mapping for one output image.
#[derive(Clone, Copy, Debug)]
struct Affine {
    m: [[f32; 2]; 2],
    tx: f32,
    ty: f32,
}

pub struct Augmenter {
    config: AugmentationConfig,
}

impl Augmenter {
    pub fn new(config: AugmentationConfig) -> Self {
        Augmenter { config }
    }

    pub fn config(&self) -> &AugmentationConfig {
        &self.config
    }

    /// Apply one random transform drawn from the configured ranges.
    pub fn augment(&self, img: &RgbImage, rng: &mut ChaCha8Rng) -> RgbImage {
        if self.config.is_identity() {
            return img.clone();
        }

        let (width, height) = img.dimensions();
        let affine = self.random_transform(width, height, rng);
        let mut out = warp(img, &affine);

        if self.config.horizontal_flip && rng.gen::<f32>() < 0.5 {
            image::imageops::flip_horizontal_in_place(&mut out);
        }

        out
    }

    fn random_transform(&self, width: u32, height: u32, rng: &mut ChaCha8Rng) -> Affine {
        let c = &self.config;

        let theta = symmetric(rng, c.rotation_range).to_radians();
        let tx = symmetric(rng, c.width_shift_range) * width as f32;
        let ty = symmetric(rng, c.height_shift_range) * height as f32;
        let shear = symmetric(rng, c.shear_range).to_radians();
        let (zx, zy) = if c.zoom_range > 0.0 {
            (
                rng.gen_range(1.0 - c.zoom_range..=1.0 + c.zoom_range),
                rng.gen_range(1.0 - c.zoom_range..=1.0 + c.zoom_range),
            )
        } else {
            (1.0, 1.0)
        };

        // rotation * shear * zoom
        let (sin_t, cos_t) = theta.sin_cos();
        let rotation = [[cos_t, -sin_t], [sin_t, cos_t]];
        let shear = [[1.0, -shear.sin()], [0.0, shear.cos()]];
        let zoom = [[zx, 0.0], [0.0, zy]];

        Affine {
            m: mat_mul(&mat_mul(&rotation, &shear), &zoom),
            tx,
            ty,
        }
    }
}

fn symmetric(rng: &mut ChaCha8Rng, range: f32) -> f32 {
    if range > 0.0 {
        rng.gen_range(-range..=range)
    } else {
        0.0
    }
}

fn mat_mul(a: &[[f32; 2]; 2], b: &[[f32; 2]; 2]) -> [[f32; 2]; 2] {
    let mut out = [[0.0; 2]; 2];
    for i in 0..2 {
        for j in 0..2 {
            out[i][j] = a[i][0] * b[0][j] + a[i][1] * b[1][j];
        }
    }
    out
}

fn warp(img: &RgbImage, affine: &Affine) -> RgbImage {
    let (width, height) = img.dimensions();
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;

    RgbImage::from_fn(width, height, |x, y| {
        let u = x as f32 - cx;
        let v = y as f32 - cy;

        let src_x = affine.m[0][0] * u + affine.m[0][1] * v + cx + affine.tx;
        let src_y = affine.m[1][0] * u + affine.m[1][1] * v + cy + affine.ty;

        bilinear_sample(img, src_x, src_y)
    })
}

fn bilinear_sample(img: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = img.dimensions();
    let max_x = (width - 1) as f32;
    let max_y = (height - 1) as f32;

    // nearest fill outside the source
    let x = x.max(0.0).min(max_x);
    let y = y.max(0.0).min(max_y);

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);

    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = img.get_pixel(x0, y0);
    let p10 = img.get_pixel(x1, y0);
    let p01 = img.get_pixel(x0, y1);
    let p11 = img.get_pixel(x1, y1);

    let mut result = [0u8; 3];
    for c in 0..3 {
        let v = p00[c] as f32 * (1.0 - fx) * (1.0 - fy)
            + p10[c] as f32 * fx * (1.0 - fy)
            + p01[c] as f32 * (1.0 - fx) * fy
            + p11[c] as f32 * fx * fy;

        result[c] = v.round().max(0.0).min(255.0) as u8;
    }

    Rgb(result)
}

/// Append the rescaled channel values of `img` in HWC order.
pub fn push_pixels(img: &RgbImage, rescale: f32, out: &mut Vec<f32>) {
    out.extend(img.as_raw().iter().map(|x| *x as f32 * rescale));
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 5 % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    #[test]
    fn identity_config_leaves_image_untouched() {
        let img = gradient(32, 24);
        let augmenter = Augmenter::new(AugmentationConfig::FOOD101.without_transforms());
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        assert_eq!(augmenter.augment(&img, &mut rng), img);
    }

    #[test]
    fn augmentation_keeps_dimensions() {
        let img = gradient(40, 30);
        let augmenter = Augmenter::new(AugmentationConfig::FOOD101);
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        for _ in 0..5 {
            let out = augmenter.augment(&img, &mut rng);
            assert_eq!(out.dimensions(), (40, 30));
        }
    }

    #[test]
    fn same_seed_same_transform() {
        let img = gradient(16, 16);
        let augmenter = Augmenter::new(AugmentationConfig::FOOD101);

        let a = augmenter.augment(&img, &mut ChaCha8Rng::seed_from_u64(42));
        let b = augmenter.augment(&img, &mut ChaCha8Rng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn zero_transform_warp_is_exact() {
        let img = gradient(9, 5);
        let affine = Affine {
            m: [[1.0, 0.0], [0.0, 1.0]],
            tx: 0.0,
            ty: 0.0,
        };
        assert_eq!(warp(&img, &affine), img);
    }

    #[test]
    fn shifted_pixels_fill_from_edge() {
        let img = gradient(8, 8);
        let affine = Affine {
            m: [[1.0, 0.0], [0.0, 1.0]],
            tx: 100.0,
            ty: 0.0,
        };
        let out = warp(&img, &affine);
        for y in 0..8 {
            assert_eq!(out.get_pixel(0, y), img.get_pixel(7, y));
        }
    }

    #[test]
    fn pixels_are_rescaled_in_hwc_order() {
        let img = RgbImage::from_raw(1, 2, vec![255, 0, 51, 102, 204, 255]).unwrap();
        let mut out = Vec::new();
        push_pixels(&img, 1.0 / 255.0, &mut out);

        let expected = [1.0, 0.0, 0.2, 0.4, 0.8, 1.0];
        assert_eq!(out.len(), expected.len());
        for (a, b) in out.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }
}
