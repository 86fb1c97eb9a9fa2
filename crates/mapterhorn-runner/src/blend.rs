//! Seam blending weights.
//!
//! Each layer's weight at a pixel depends on how far the pixel is from the
//! nearest pixel where that layer has no data. Deep inside a layer the
//! weight is 1 and the layer wins outright; towards its edge the weight
//! falls to 0 and the layers below show through.

use mapterhorn_plan::BlendConfig;

/// Chamfer step between 8-connected neighbours.
const DIAGONAL: f32 = std::f32::consts::SQRT_2;

/// Per-pixel weights of a layer whose valid pixels are `valid`.
///
/// Invalid pixels get weight 0.
pub fn layer_weights(blend: &BlendConfig, valid: &[bool], width: usize) -> Vec<f32> {
    distance_to_invalid(valid, width)
        .into_iter()
        .map(|d| blend.weight_at(d))
        .collect()
}

/// Chamfer distance from every pixel to the nearest invalid pixel.
///
/// Invalid pixels are at distance 0. The grid border does not count as an
/// edge: a grid without invalid pixels is at infinite distance everywhere.
pub fn distance_to_invalid(valid: &[bool], width: usize) -> Vec<f32> {
    if width == 0 {
        return Vec::new();
    }
    let height = valid.len() / width;
    let mut dist: Vec<f32> = valid
        .iter()
        .map(|&v| if v { f32::INFINITY } else { 0.0 })
        .collect();

    // Forward pass: top-left to bottom-right
    for row in 0..height {
        for col in 0..width {
            let i = row * width + col;
            let mut d = dist[i];
            if col > 0 {
                d = d.min(dist[i - 1] + 1.0);
            }
            if row > 0 {
                let up = i - width;
                d = d.min(dist[up] + 1.0);
                if col > 0 {
                    d = d.min(dist[up - 1] + DIAGONAL);
                }
                if col + 1 < width {
                    d = d.min(dist[up + 1] + DIAGONAL);
                }
            }
            dist[i] = d;
        }
    }

    // Backward pass: bottom-right to top-left
    for row in (0..height).rev() {
        for col in (0..width).rev() {
            let i = row * width + col;
            let mut d = dist[i];
            if col + 1 < width {
                d = d.min(dist[i + 1] + 1.0);
            }
            if row + 1 < height {
                let down = i + width;
                d = d.min(dist[down] + 1.0);
                if col + 1 < width {
                    d = d.min(dist[down + 1] + DIAGONAL);
                }
                if col > 0 {
                    d = d.min(dist[down - 1] + DIAGONAL);
                }
            }
            dist[i] = d;
        }
    }
    dist
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use mapterhorn_plan::Kernel;

    #[test]
    fn test_distance_single_hole() {
        let width = 5;
        let mut valid = vec![true; 25];
        valid[12] = false;
        let d = distance_to_invalid(&valid, width);
        assert_eq!(d[12], 0.0);
        assert_eq!(d[11], 1.0);
        assert_eq!(d[7], 1.0);
        assert_relative_eq!(d[6], DIAGONAL);
        assert_relative_eq!(d[0], 2.0 * DIAGONAL);
        assert_eq!(d[2], 2.0);
    }

    #[test]
    fn test_border_is_not_an_edge() {
        let d = distance_to_invalid(&[true; 16], 4);
        assert!(d.iter().all(|v| v.is_infinite()));

        let weights = layer_weights(&BlendConfig::default(), &[true; 16], 4);
        assert!(weights.iter().all(|&w| w == 1.0));
    }

    #[test]
    fn test_weights_ramp_from_edge() {
        // Left half invalid, right half valid
        let width = 40;
        let valid: Vec<bool> = (0..width * 3).map(|i| i % width >= 20).collect();
        let blend = BlendConfig {
            falloff_px: 8.0,
            kernel: Kernel::Linear,
        };
        let w = layer_weights(&blend, &valid, width);
        let row = &w[width..2 * width];
        assert_eq!(row[19], 0.0);
        assert_relative_eq!(row[20], 1.0 / 8.0);
        assert_relative_eq!(row[23], 4.0 / 8.0);
        assert_eq!(row[28], 1.0);
        assert_eq!(row[39], 1.0);
    }
}
