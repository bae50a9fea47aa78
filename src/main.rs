use std::thread;
use std::time::Duration;

use anyhow::Result;
use nalgebra::{UnitQuaternion, Vector3};
use tracing::info;
use tracing_subscriber::EnvFilter;

use fusion_slam::cloud::PointCloud;
use fusion_slam::geometry::SE3;
use fusion_slam::map::{Keyframe, ScanFeatures, Timestamp};
use fusion_slam::system::{BackendConfig, SlamBackend};

/// Fixed world structure the simulated sensor observes: a sparse lattice
/// covering the demo loop's area.
fn structure() -> PointCloud {
    let mut points = Vec::new();
    let mut x = -2.0;
    while x <= 22.0 {
        let mut y = -2.0;
        while y <= 22.0 {
            points.push(Vector3::new(x, y, 1.0));
            points.push(Vector3::new(x, y, 2.5));
            y += 1.8;
        }
        x += 1.8;
    }
    PointCloud::from_points(points)
}

/// True position after walking `steps` two-unit steps around a 20-unit
/// square, counter-clockwise from the origin.
fn square_position(steps: usize) -> Vector3<f64> {
    let d = (2 * (steps % 40)) as f64;
    let (x, y) = match d {
        d if d < 20.0 => (d, 0.0),
        d if d < 40.0 => (20.0, d - 20.0),
        d if d < 60.0 => (60.0 - d, 20.0),
        d => (0.0, 80.0 - d),
    };
    Vector3::new(x, y, 0.0)
}

fn world_pose(position: Vector3<f64>) -> SE3 {
    SE3::new(UnitQuaternion::identity(), -position)
}

/// Drives the backend with a synthetic square loop whose stored poses
/// accumulate drift, then walks off to break the revisit streak. The
/// relocation engine should close the loop and pull the trajectory back
/// onto the structure.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut backend = SlamBackend::new(None, BackendConfig::default());
    let shared = backend.shared_state().clone();
    let world = structure();
    let full_drift = Vector3::new(0.3, -0.2, 0.0);

    info!("feeding a 40-step square loop with {:.2} m of drift", full_drift.norm());
    for step in 0..=40 {
        let time = Timestamp::new(step as f64 * 0.5);
        let true_pose = world_pose(square_position(step));
        let drift = full_drift * (step as f64 / 40.0);
        let stored_pose = world_pose(square_position(step) + drift);

        let mut kf = Keyframe::new(time, stored_pose);
        kf.scan = Some(ScanFeatures::new(
            world.transformed(&true_pose),
            PointCloud::new(),
        ));
        shared.map.write().insert(kf)?;
        shared.tracking.publish(time, stored_pose);
        shared.publish_backend_head(time);
        thread::sleep(Duration::from_millis(25));
    }

    // leave the loop so the revisit streak ends and the episode finalizes
    for (i, x) in [0.0, 4.0, 8.0].into_iter().enumerate() {
        let time = Timestamp::new(20.5 + i as f64 * 0.5);
        let pose = world_pose(Vector3::new(x, -15.0, 0.0));
        shared.map.write().insert(Keyframe::new(time, pose))?;
        shared.tracking.publish(time, pose);
        shared.publish_backend_head(time);
        thread::sleep(Duration::from_millis(25));
    }

    // let the consumers drain and the correction commit
    thread::sleep(Duration::from_secs(2));

    {
        let map = shared.map.read();
        let anchors = map.iter().filter(|kf| kf.loop_constraint.is_some()).count();
        let closing = map
            .iter()
            .find(|kf| kf.loop_constraint.is_some())
            .map(|kf| (kf.time, kf.position()));
        info!(
            "map holds {} keyframes, {} loop anchors, {} corrections recorded",
            map.len(),
            anchors,
            shared.submaps.lock().len()
        );
        if let Some((time, position)) = closing {
            info!(
                "loop closed at {time}: position [{:.2}, {:.2}] (true [0.00, 0.00] + residual drift)",
                position.x, position.y
            );
        }
    }
    if let Some(state) = shared.tracking.snapshot() {
        let position = state.pose.inverse().translation;
        info!(
            "live tracking at {}: [{:.2}, {:.2}]",
            state.time, position.x, position.y
        );
    }
    info!("global map holds {} points", backend.global_map().len());

    backend.shutdown();
    Ok(())
}
