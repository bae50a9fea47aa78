//! Geometric verification of loop candidates.
//!
//! A candidate becomes a loop constraint only after its geometry is
//! confirmed, either by registering the keyframe's scan against a densified
//! historical cloud or, for camera-only keyframes, by descriptor matching
//! plus robust pose estimation. Verification never mutates the map.

use tracing::debug;

use crate::cloud::{icp_align, voxel_downsample, IcpConfig};
use crate::geometry::{solve_pnp_ransac, CameraModel, PnpConfig, SE3};
use crate::map::{Keyframe, KeyframeMap, LandmarkId, LandmarkStore, Timestamp};

#[derive(Debug, Clone)]
pub struct VerifyConfig {
    /// Minimum descriptor matches for the image path; fewer fails closed.
    pub min_matches: usize,
    /// Hamming acceptance threshold for descriptor matches.
    pub hamming_threshold: u32,
    pub icp: IcpConfig,
    /// Extra single-iteration registration passes after the main alignment,
    /// holding the matched keyframe fixed.
    pub refine_passes: usize,
    /// Stop refining once the error ratio between passes exceeds this.
    pub improvement_cutoff: f64,
    /// Leaf size for the densified target cloud.
    pub voxel_leaf: f64,
    pub pnp: PnpConfig,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            min_matches: 20,
            hamming_threshold: 160,
            icp: IcpConfig {
                max_iterations: 100,
                ..IcpConfig::default()
            },
            refine_passes: 4,
            improvement_cutoff: 0.99,
            voxel_leaf: 0.4,
            pnp: PnpConfig::default(),
        }
    }
}

/// Verify a loop candidate, producing the relative pose with
/// `pose_frame = relative ∘ pose_matched`. Point registration is used when
/// both keyframes carry scans; otherwise the image path runs if a camera
/// model is available. Returns None when geometry cannot be confirmed.
pub fn verify_loop(
    map: &KeyframeMap,
    landmarks: &LandmarkStore,
    camera: Option<&CameraModel>,
    frame_time: Timestamp,
    matched_time: Timestamp,
    config: &VerifyConfig,
) -> Option<SE3> {
    let frame = map.get(frame_time)?;
    let old = map.get(matched_time)?;
    let relative = if frame.has_scan() && old.has_scan() {
        verify_by_points(map, frame, old, config)
    } else if let Some(camera) = camera {
        verify_by_image(landmarks, frame, old, camera, config)
    } else {
        None
    };
    if relative.is_none() {
        debug!("loop {frame_time} -> {matched_time} failed geometric verification");
    }
    relative
}

fn verify_by_points(
    map: &KeyframeMap,
    frame: &Keyframe,
    old: &Keyframe,
    config: &VerifyConfig,
) -> Option<SE3> {
    let source = frame.scan.as_ref()?.merged();

    // Densify the target by folding the matched keyframe's chronological
    // neighbors into its body frame.
    let mut target = old.scan.as_ref()?.merged();
    for neighbor in [map.nearest_before(old.time), map.nearest_after(old.time)]
        .into_iter()
        .flatten()
    {
        let Some(scan) = &neighbor.scan else {
            continue;
        };
        let into_old = old.pose.compose(&neighbor.pose.inverse());
        target.extend_from(&scan.merged().transformed(&into_old));
    }
    let target = voxel_downsample(&target, config.voxel_leaf);

    // Drift is planar to first order; flatten the initial vertical offset.
    let mut initial = old.pose.compose(&frame.pose.inverse());
    initial.translation.z = 0.0;

    let result = icp_align(&source, &target, &initial, &config.icp)?;
    if !result.converged {
        return None;
    }

    let mut transform = result.transform;
    let mut error = result.inlier_rmse;
    let single_pass = IcpConfig {
        max_iterations: 1,
        ..config.icp.clone()
    };
    for _ in 0..config.refine_passes {
        let Some(pass) = icp_align(&source, &target, &transform, &single_pass) else {
            break;
        };
        transform = pass.transform;
        if error > 0.0 && pass.inlier_rmse / error > config.improvement_cutoff {
            break;
        }
        error = pass.inlier_rmse;
    }
    Some(transform.inverse())
}

fn verify_by_image(
    landmarks: &LandmarkStore,
    frame: &Keyframe,
    old: &Keyframe,
    camera: &CameraModel,
    config: &VerifyConfig,
) -> Option<SE3> {
    let frame_vis = frame.visual.as_ref()?;
    let old_vis = old.visual.as_ref()?;

    let mut points = Vec::new();
    let mut pixels = Vec::new();
    for keypoint in &frame_vis.keypoints {
        let Some(descriptor) = &keypoint.descriptor else {
            continue;
        };
        let mut best: Option<(u32, LandmarkId)> = None;
        for old_kp in &old_vis.keypoints {
            let (Some(old_desc), Some(landmark)) = (&old_kp.descriptor, old_kp.landmark) else {
                continue;
            };
            let distance = descriptor.hamming_distance(old_desc);
            if best.map_or(true, |(d, _)| distance < d) {
                best = Some((distance, landmark));
            }
        }
        let Some((distance, landmark)) = best else {
            continue;
        };
        if distance >= config.hamming_threshold {
            continue;
        }
        let Some(position) = landmarks.position_of(landmark) else {
            continue;
        };
        points.push(position);
        pixels.push(keypoint.pixel);
    }
    if points.len() < config.min_matches {
        debug!(
            "{} descriptor matches, need {}",
            points.len(),
            config.min_matches
        );
        return None;
    }
    let result = solve_pnp_ransac(&points, &pixels, camera, &frame.pose, &config.pnp)?;
    Some(result.pose.compose(&old.pose.inverse()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::PointCloud;
    use crate::map::{Descriptor, Keypoint, ScanFeatures, VisualFeatures};
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    fn lattice() -> PointCloud {
        let mut points = Vec::new();
        for i in 0..7 {
            for j in 0..7 {
                for k in 0..3 {
                    points.push(Vector3::new(
                        i as f64 * 0.8 - 2.4,
                        j as f64 * 0.8 - 2.4,
                        k as f64 * 0.8 + 0.8,
                    ));
                }
            }
        }
        PointCloud::from_points(points)
    }

    fn world_pose(x: f64, y: f64) -> SE3 {
        SE3::new(UnitQuaternion::identity(), Vector3::new(-x, -y, 0.0))
    }

    fn scan_keyframe(t: f64, true_pose: &SE3, stored_pose: &SE3) -> Keyframe {
        let body = lattice().transformed(true_pose);
        let mut kf = Keyframe::new(Timestamp::new(t), *stored_pose);
        kf.scan = Some(ScanFeatures::new(body, PointCloud::new()));
        kf
    }

    #[test]
    fn point_verification_recovers_the_drift() {
        let mut map = KeyframeMap::new();
        for (t, x) in [(1.0, 0.0), (2.0, 0.5), (3.0, 1.0)] {
            let pose = world_pose(x, 0.0);
            map.insert(scan_keyframe(t, &pose, &pose)).unwrap();
        }
        // revisit: true position (0.6, 0.2), stored estimate drifted
        let true_pose = world_pose(0.6, 0.2);
        let stored = world_pose(0.9, -0.1);
        map.insert(scan_keyframe(20.0, &true_pose, &stored)).unwrap();

        let relative = verify_loop(
            &map,
            &LandmarkStore::new(),
            None,
            Timestamp::new(20.0),
            Timestamp::new(2.0),
            &VerifyConfig::default(),
        )
        .unwrap();

        let verified = relative.compose(&map.get(Timestamp::new(2.0)).unwrap().pose);
        assert_relative_eq!(verified.translation.x, true_pose.translation.x, epsilon = 1e-3);
        assert_relative_eq!(verified.translation.y, true_pose.translation.y, epsilon = 1e-3);
        assert_relative_eq!(verified.translation.z, true_pose.translation.z, epsilon = 1e-3);
    }

    #[test]
    fn registration_failure_rejects_the_candidate() {
        let mut map = KeyframeMap::new();
        let old_pose = world_pose(0.0, 0.0);
        map.insert(scan_keyframe(1.0, &old_pose, &old_pose)).unwrap();
        // a frame whose cloud shares nothing with the candidate's
        let far = world_pose(500.0, 0.0);
        map.insert(scan_keyframe(20.0, &far, &world_pose(0.2, 0.0)))
            .unwrap();

        let relative = verify_loop(
            &map,
            &LandmarkStore::new(),
            None,
            Timestamp::new(20.0),
            Timestamp::new(1.0),
            &VerifyConfig::default(),
        );
        assert!(relative.is_none());
    }

    fn camera() -> CameraModel {
        CameraModel {
            fx: 400.0,
            fy: 400.0,
            cx: 320.0,
            cy: 240.0,
        }
    }

    #[test]
    fn image_verification_recovers_the_pose_from_landmarks() {
        let camera = camera();
        let mut landmarks = LandmarkStore::new();
        let mut map = KeyframeMap::new();

        // landmarks on a grid in front of the origin
        let mut old_keypoints = Vec::new();
        let mut world_points = Vec::new();
        let mut fill = 0u8;
        for i in 0..5 {
            for j in 0..5 {
                let world = Vector3::new(i as f64 - 2.0, j as f64 - 2.0, 6.0 + ((i + j) % 3) as f64);
                let id = landmarks.create(world);
                let mut kp = Keypoint::new(nalgebra::Vector2::new(0.0, 0.0));
                kp.landmark = Some(id);
                kp.descriptor = Some(Descriptor([fill; 32]));
                old_keypoints.push(kp);
                world_points.push(world);
                fill = fill.wrapping_add(10);
            }
        }
        let old_pose = world_pose(0.0, 0.0);
        let mut old = Keyframe::new(Timestamp::new(1.0), old_pose);
        old.visual = Some(VisualFeatures {
            image: None,
            keypoints: old_keypoints,
        });
        map.insert(old).unwrap();

        // the revisiting frame sees the same landmarks from a nearby pose
        let true_pose = SE3::new(UnitQuaternion::identity(), Vector3::new(-0.4, -0.2, 0.0));
        let mut frame_keypoints = Vec::new();
        let mut fill = 0u8;
        for world in &world_points {
            let body = true_pose.transform_point(world);
            let pixel = camera.project(&body).unwrap();
            let mut kp = Keypoint::new(pixel);
            kp.descriptor = Some(Descriptor([fill; 32]));
            frame_keypoints.push(kp);
            fill = fill.wrapping_add(10);
        }
        let stored = SE3::new(UnitQuaternion::identity(), Vector3::new(-0.6, 0.1, 0.0));
        let mut frame = Keyframe::new(Timestamp::new(20.0), stored);
        frame.visual = Some(VisualFeatures {
            image: None,
            keypoints: frame_keypoints,
        });
        map.insert(frame).unwrap();

        let relative = verify_loop(
            &map,
            &landmarks,
            Some(&camera),
            Timestamp::new(20.0),
            Timestamp::new(1.0),
            &VerifyConfig::default(),
        )
        .unwrap();

        let verified = relative.compose(&old_pose);
        assert_relative_eq!(verified.translation.x, true_pose.translation.x, epsilon = 1e-3);
        assert_relative_eq!(verified.translation.y, true_pose.translation.y, epsilon = 1e-3);
    }

    #[test]
    fn too_few_descriptor_matches_fail_closed() {
        let camera = camera();
        let mut landmarks = LandmarkStore::new();
        let mut map = KeyframeMap::new();

        let id = landmarks.create(Vector3::new(0.0, 0.0, 5.0));
        let mut old_kp = Keypoint::new(nalgebra::Vector2::new(0.0, 0.0));
        old_kp.landmark = Some(id);
        old_kp.descriptor = Some(Descriptor([0; 32]));
        let mut old = Keyframe::new(Timestamp::new(1.0), SE3::identity());
        old.visual = Some(VisualFeatures {
            image: None,
            keypoints: vec![old_kp],
        });
        map.insert(old).unwrap();

        let mut frame_kp = Keypoint::new(nalgebra::Vector2::new(320.0, 240.0));
        frame_kp.descriptor = Some(Descriptor([0; 32]));
        let mut frame = Keyframe::new(Timestamp::new(20.0), SE3::identity());
        frame.visual = Some(VisualFeatures {
            image: None,
            keypoints: vec![frame_kp],
        });
        map.insert(frame).unwrap();

        let relative = verify_loop(
            &map,
            &landmarks,
            Some(&camera),
            Timestamp::new(20.0),
            Timestamp::new(1.0),
            &VerifyConfig::default(),
        );
        assert!(relative.is_none());
    }
}
