//! Depth filtering and mesh generation.
//!
//! The mesher turns a depth map plus calibration into renderable geometry:
//! per-pixel XYZUV vertices in the color-camera frame and triangle indices
//! over the pixel grid. Culling zeroes depth pixels in place, so triangle
//! generation after culling stays consistent with the vertex field.

use volcap_types::{CameraCalibration, ClipRegion};

/// Floats per mesh vertex: x, y, z, u, v.
pub const FLOATS_PER_VERTEX: usize = 5;

/// Neighboring depth difference above which a quad is treated as a
/// silhouette edge and not triangulated, in millimeters.
const TRIANGLE_EDGE_MM: u16 = 100;

/// Temporal hold band: a pixel within this distance of its previous value
/// keeps the previous value, in millimeters.
const STABILIZE_BAND_MM: u16 = 16;

/// Rectangle in color-image pixels handed to the video encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Holds static objects steady across frames to reduce sensor shimmer.
#[derive(Default)]
pub struct TemporalDepthFilter {
    previous: Vec<u16>,
    width: usize,
    height: usize,
}

impl TemporalDepthFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(&mut self, depth: &mut [u16], width: usize, height: usize) {
        if self.width != width || self.height != height {
            self.previous = vec![0; width * height];
            self.width = width;
            self.height = height;
        }
        for (d, prev) in depth.iter_mut().zip(self.previous.iter_mut()) {
            if *d != 0 && *prev != 0 && d.abs_diff(*prev) <= STABILIZE_BAND_MM {
                *d = *prev;
            } else {
                *prev = *d;
            }
        }
    }
}

/// Removes boundary pixels with low confidence; the outer edge of a
/// surface is where neighboring depth cameras disagree and seams show.
pub fn edge_filter(depth: &mut [u16], width: usize, height: usize) {
    let snapshot = depth.to_vec();
    let at = |x: isize, y: isize| -> u16 {
        if x < 0 || y < 0 || x as usize >= width || y as usize >= height {
            0
        } else {
            snapshot[y as usize * width + x as usize]
        }
    };
    for y in 0..height as isize {
        for x in 0..width as isize {
            let center = at(x, y);
            if center == 0 {
                continue;
            }
            if at(x - 1, y) == 0 || at(x + 1, y) == 0 || at(x, y - 1) == 0 || at(x, y + 1) == 0 {
                depth[y as usize * width + x as usize] = 0;
            }
        }
    }
}

/// Generates mesh geometry from depth using the camera calibration.
pub struct DepthMesher {
    calibration: CameraCalibration,
}

impl DepthMesher {
    pub fn new(calibration: CameraCalibration) -> Self {
        Self { calibration }
    }

    pub fn calibration(&self) -> &CameraCalibration {
        &self.calibration
    }

    /// Unproject one depth pixel into the color-camera frame, meters.
    fn color_space_point(&self, x: usize, y: usize, depth_mm: u16) -> [f32; 3] {
        let d = &self.calibration.depth;
        let z = f32::from(depth_mm) / 1000.0;
        let px = (x as f32 - d.cx) / d.fx * z;
        let py = (y as f32 - d.cy) / d.fy * z;
        let p = [px, py, z];

        // Q = P * R + T
        let r = &self.calibration.rotation_from_depth;
        let t = &self.calibration.translation_from_depth;
        [
            p[0] * r[0] + p[1] * r[3] + p[2] * r[6] + t[0],
            p[0] * r[1] + p[1] * r[4] + p[2] * r[7] + t[1],
            p[0] * r[2] + p[1] * r[5] + p[2] * r[8] + t[2],
        ]
    }

    fn color_pixel(&self, q: &[f32; 3]) -> Option<(f32, f32)> {
        if q[2] <= 0.0 {
            return None;
        }
        let c = &self.calibration.color;
        Some((q[0] / q[2] * c.fx + c.cx, q[1] / q[2] * c.fy + c.cy))
    }

    fn scene_point(clip: &ClipRegion, q: &[f32; 3]) -> [f32; 3] {
        let m = &clip.extrinsics;
        [
            m[0] * q[0] + m[1] * q[1] + m[2] * q[2] + m[3],
            m[4] * q[0] + m[5] * q[1] + m[6] * q[2] + m[7],
            m[8] * q[0] + m[9] * q[1] + m[10] * q[2] + m[11],
        ]
    }

    fn outside_clip(clip: &ClipRegion, q: &[f32; 3]) -> bool {
        let w = Self::scene_point(clip, q);
        let radial = (w[0] * w[0] + w[2] * w[2]).sqrt();
        radial > clip.radius || w[1] < clip.floor || w[1] > clip.ceiling
    }

    /// Produce the per-pixel vertex field.
    ///
    /// Culled and invalid pixels are zeroed in `depth` as well as in the
    /// vertex output, so triangle generation afterwards agrees with the
    /// vertex field.
    pub fn generate_coordinates(
        &self,
        depth: &mut [u16],
        clip: Option<&ClipRegion>,
        face_painting_fix: bool,
        cull: bool,
        vertices: &mut Vec<f32>,
    ) {
        let width = self.calibration.depth.width as usize;
        let height = self.calibration.depth.height as usize;
        let color_w = self.calibration.color.width as f32;
        let color_h = self.calibration.color.height as f32;

        // Nearfield threshold for the backdrop fix.
        let near_cut_mm = if face_painting_fix {
            let mut sum = 0u64;
            let mut count = 0u64;
            for &d in depth.iter() {
                if d != 0 {
                    sum += u64::from(d);
                    count += 1;
                }
            }
            if count > 0 {
                (sum / count / 2) as u16
            } else {
                0
            }
        } else {
            0
        };

        vertices.clear();
        vertices.resize(width * height * FLOATS_PER_VERTEX, 0.0);

        for y in 0..height {
            for x in 0..width {
                let index = y * width + x;
                let d = depth[index];
                if d == 0 {
                    continue;
                }
                if near_cut_mm != 0 && d < near_cut_mm {
                    depth[index] = 0;
                    continue;
                }
                let q = self.color_space_point(x, y, d);
                if cull {
                    if let Some(clip) = clip {
                        if Self::outside_clip(clip, &q) {
                            depth[index] = 0;
                            continue;
                        }
                    }
                }
                let Some((u_px, v_px)) = self.color_pixel(&q) else {
                    depth[index] = 0;
                    continue;
                };
                let out = &mut vertices[index * FLOATS_PER_VERTEX..][..FLOATS_PER_VERTEX];
                out[0] = q[0];
                out[1] = q[1];
                out[2] = q[2];
                out[3] = u_px / color_w;
                out[4] = v_px / color_h;
            }
        }
    }

    /// Triangulate the pixel grid. Quads whose four corners are valid and
    /// within [`TRIANGLE_EDGE_MM`] of each other yield two triangles.
    pub fn generate_triangle_indices(&self, depth: &[u16], indices: &mut Vec<u32>) {
        let width = self.calibration.depth.width as usize;
        let height = self.calibration.depth.height as usize;
        indices.clear();
        for y in 0..height.saturating_sub(1) {
            for x in 0..width.saturating_sub(1) {
                let i00 = y * width + x;
                let i10 = i00 + 1;
                let i01 = i00 + width;
                let i11 = i01 + 1;
                let quad = [depth[i00], depth[i10], depth[i01], depth[i11]];
                if quad.iter().any(|&d| d == 0) {
                    continue;
                }
                let min = *quad.iter().min().expect("non-empty");
                let max = *quad.iter().max().expect("non-empty");
                if max - min > TRIANGLE_EDGE_MM {
                    continue;
                }
                indices.extend_from_slice(&[i00 as u32, i01 as u32, i10 as u32]);
                indices.extend_from_slice(&[i10 as u32, i01 as u32, i11 as u32]);
            }
        }
    }

    /// Compute the color-image crop rectangle enclosing all depth pixels
    /// that survive the clip. Recomputed only when the clip or extrinsics
    /// epoch advances; encoders cannot tolerate per-frame crop changes.
    pub fn calculate_crop(&self, depth: &[u16], clip: &ClipRegion) -> CropRegion {
        let width = self.calibration.depth.width as usize;
        let height = self.calibration.depth.height as usize;
        let color_w = self.calibration.color.width as u32;
        let color_h = self.calibration.color.height as u32;

        let mut min_x = f32::MAX;
        let mut min_y = f32::MAX;
        let mut max_x = f32::MIN;
        let mut max_y = f32::MIN;
        let mut any = false;

        for y in 0..height {
            for x in 0..width {
                let d = depth[y * width + x];
                if d == 0 {
                    continue;
                }
                let q = self.color_space_point(x, y, d);
                if Self::outside_clip(clip, &q) {
                    continue;
                }
                if let Some((u_px, v_px)) = self.color_pixel(&q) {
                    min_x = min_x.min(u_px);
                    min_y = min_y.min(v_px);
                    max_x = max_x.max(u_px);
                    max_y = max_y.max(v_px);
                    any = true;
                }
            }
        }

        if !any {
            return CropRegion {
                x: 0,
                y: 0,
                width: color_w,
                height: color_h,
            };
        }

        // Pad and align to 16-pixel macroblock boundaries.
        let x0 = ((min_x.max(0.0) as u32) / 16) * 16;
        let y0 = ((min_y.max(0.0) as u32) / 16) * 16;
        let x1 = (((max_x as u32).min(color_w) + 15) / 16 * 16).min(color_w);
        let y1 = (((max_y as u32).min(color_h) + 15) / 16 * 16).min(color_h);
        CropRegion {
            x: x0,
            y: y0,
            width: x1.saturating_sub(x0).max(16),
            height: y1.saturating_sub(y0).max(16),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use volcap_types::{CameraIntrinsics, LensModel, IDENTITY_TRANSFORM};

    fn test_calibration(depth_w: i32, depth_h: i32) -> CameraCalibration {
        let intr = |w: i32, h: i32| CameraIntrinsics {
            width: w,
            height: h,
            lens_model: LensModel::BrownConrady,
            cx: w as f32 / 2.0,
            cy: h as f32 / 2.0,
            fx: w as f32 * 0.6,
            fy: w as f32 * 0.6,
            k: [0.0; 6],
            codx: 0.0,
            cody: 0.0,
            p1: 0.0,
            p2: 0.0,
        };
        let mut rotation = [0f32; 9];
        rotation[0] = 1.0;
        rotation[4] = 1.0;
        rotation[8] = 1.0;
        CameraCalibration {
            color: intr(1280, 720),
            depth: intr(depth_w, depth_h),
            rotation_from_depth: rotation,
            translation_from_depth: [0.032, 0.0, 0.0],
        }
    }

    #[test]
    fn flat_plane_produces_vertices_and_triangles() {
        let mesher = DepthMesher::new(test_calibration(32, 24));
        let mut depth = vec![1500u16; 32 * 24];
        let mut vertices = Vec::new();
        mesher.generate_coordinates(&mut depth, None, false, true, &mut vertices);
        assert_eq!(vertices.len(), 32 * 24 * FLOATS_PER_VERTEX);
        // Center pixel should sit straight ahead at 1.5 m.
        let center = (12 * 32 + 16) * FLOATS_PER_VERTEX;
        assert!((vertices[center + 2] - 1.5).abs() < 1e-3);

        let mut indices = Vec::new();
        mesher.generate_triangle_indices(&depth, &mut indices);
        assert_eq!(indices.len(), 31 * 23 * 6);
    }

    #[test]
    fn tight_clip_culls_everything() {
        let mesher = DepthMesher::new(test_calibration(16, 16));
        let mut depth = vec![1500u16; 16 * 16];
        let clip = ClipRegion {
            extrinsics: IDENTITY_TRANSFORM,
            radius: 0.001,
            floor: -0.001,
            ceiling: 0.001,
        };
        let mut vertices = Vec::new();
        mesher.generate_coordinates(&mut depth, Some(&clip), false, true, &mut vertices);
        assert!(depth.iter().all(|&d| d == 0));
        assert!(vertices.iter().all(|&v| v == 0.0));

        let mut indices = Vec::new();
        mesher.generate_triangle_indices(&depth, &mut indices);
        assert!(indices.is_empty());
    }

    #[test]
    fn calibration_mode_skips_culling() {
        let mesher = DepthMesher::new(test_calibration(16, 16));
        let mut depth = vec![1500u16; 16 * 16];
        let clip = ClipRegion {
            extrinsics: IDENTITY_TRANSFORM,
            radius: 0.001,
            floor: -0.001,
            ceiling: 0.001,
        };
        let mut vertices = Vec::new();
        // cull=false models calibration mode.
        mesher.generate_coordinates(&mut depth, Some(&clip), false, false, &mut vertices);
        assert!(depth.iter().any(|&d| d != 0));
    }

    #[test]
    fn edge_filter_trims_silhouette() {
        let mut depth = vec![0u16; 8 * 8];
        for y in 2..6 {
            for x in 2..6 {
                depth[y * 8 + x] = 1000;
            }
        }
        edge_filter(&mut depth, 8, 8);
        // The 4x4 block loses its one-pixel rim, leaving the 2x2 core.
        let remaining = depth.iter().filter(|&&d| d != 0).count();
        assert_eq!(remaining, 4);
        assert_ne!(depth[3 * 8 + 3], 0);
        assert_eq!(depth[2 * 8 + 2], 0);
    }

    #[test]
    fn temporal_filter_holds_static_pixels() {
        let mut filter = TemporalDepthFilter::new();
        let mut frame1 = vec![1000u16; 4];
        filter.filter(&mut frame1, 2, 2);
        let mut frame2 = vec![1008u16; 4];
        filter.filter(&mut frame2, 2, 2);
        // Within the hold band: snapped back to the first value.
        assert!(frame2.iter().all(|&d| d == 1000));
        let mut frame3 = vec![1200u16; 4];
        filter.filter(&mut frame3, 2, 2);
        assert!(frame3.iter().all(|&d| d == 1200));
    }

    #[test]
    fn crop_covers_clipped_region_only() {
        let mesher = DepthMesher::new(test_calibration(32, 32));
        let depth = vec![1500u16; 32 * 32];
        // The plane sits at z = 1.5 m, so a 1.6 m cylinder keeps only the
        // pixels within ~0.56 m of the optical axis.
        let clip = ClipRegion {
            extrinsics: IDENTITY_TRANSFORM,
            radius: 1.6,
            floor: -10.0,
            ceiling: 10.0,
        };
        let crop = mesher.calculate_crop(&depth, &clip);
        assert!(crop.width >= 16);
        assert!(crop.width < 1280);
        assert_eq!(crop.width % 16, 0);
    }
}
