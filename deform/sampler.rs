//! Per-point displacement extraction between corresponding point sets.

use crate::geometry::{
    PointGeometry, REST_ATTRIBUTE, TANGENT_U_ATTRIBUTE, TANGENT_V_ATTRIBUTE, attribute_vector,
};
use glam::{DMat3, DQuat, DVec3};
use ndarray::{Array1, ArrayView2};
use thiserror::Error;

/// Vectors shorter than this have no usable direction.
const DEGENERATE_DIRECTION: f64 = 1.0e-12;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SampleError {
    #[error("point count doesn't match: expected {expected}, found {found}")]
    PointCountMismatch { expected: usize, found: usize },
    #[error("{role} geometry is missing the '{attribute}' attribute")]
    MissingAttribute {
        role: &'static str,
        attribute: &'static str,
    },
}

/// How example displacements are measured.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeltaMode {
    /// World-space offset from the base pose.
    #[default]
    Plain,
    /// Offset from the skin pose rotated into the rest pose's tangent frame.
    PoseSpace,
}

fn check_count<G: PointGeometry>(expected: usize, geometry: &G) -> Result<(), SampleError> {
    let found = geometry.point_count();
    if found != expected {
        return Err(SampleError::PointCountMismatch { expected, found });
    }
    Ok(())
}

fn required_attribute<'a, G: PointGeometry>(
    geometry: &'a G,
    role: &'static str,
    attribute: &'static str,
) -> Result<ArrayView2<'a, f64>, SampleError> {
    geometry
        .vector_attribute(attribute)
        .ok_or(SampleError::MissingAttribute { role, attribute })
}

fn store(delta: &mut Array1<f64>, index: usize, value: DVec3) {
    delta[3 * index] = value.x;
    delta[3 * index + 1] = value.y;
    delta[3 * index + 2] = value.z;
}

/// The minimal rotation taking direction `from` onto direction `to`.
///
/// Returns the identity when either vector is too short to define a direction.
pub fn dihedral(from: DVec3, to: DVec3) -> DMat3 {
    if from.length() < DEGENERATE_DIRECTION || to.length() < DEGENERATE_DIRECTION {
        return DMat3::IDENTITY;
    }
    DMat3::from_quat(DQuat::from_rotation_arc(from.normalize(), to.normalize()))
}

/// Flattened `shape - base` for every point.
pub fn plain_delta<B, S>(base: &B, shape: &S) -> Result<Array1<f64>, SampleError>
where
    B: PointGeometry,
    S: PointGeometry,
{
    let count = base.point_count();
    check_count(count, shape)?;
    let mut delta = Array1::zeros(3 * count);
    for index in 0..count {
        store(
            &mut delta,
            index,
            shape.position(index) - base.position(index),
        );
    }
    Ok(delta)
}

/// Flattened `R * (shape - skin)` where `R` maps the skin's tangent frame onto the rest frame.
pub fn pose_space_delta<R, K, S>(rest: &R, skin: &K, shape: &S) -> Result<Array1<f64>, SampleError>
where
    R: PointGeometry,
    K: PointGeometry,
    S: PointGeometry,
{
    let count = rest.point_count();
    check_count(count, skin)?;
    check_count(count, shape)?;

    let rest_u = required_attribute(rest, "rest", TANGENT_U_ATTRIBUTE)?;
    let rest_v = required_attribute(rest, "rest", TANGENT_V_ATTRIBUTE)?;
    let skin_u = required_attribute(skin, "skin", TANGENT_U_ATTRIBUTE)?;
    let skin_v = required_attribute(skin, "skin", TANGENT_V_ATTRIBUTE)?;

    let mut delta = Array1::zeros(3 * count);
    for index in 0..count {
        let rotate_u = dihedral(
            attribute_vector(&skin_u, index),
            attribute_vector(&rest_u, index),
        );
        let rotate_v = dihedral(
            attribute_vector(&skin_v, index),
            attribute_vector(&rest_v, index),
        );
        let offset = shape.position(index) - skin.position(index);
        store(&mut delta, index, rotate_u * rotate_v * offset);
    }
    Ok(delta)
}

/// Displacement of one example, relative to `skin` when given and to `rest` otherwise.
pub fn sample_displacement<R, S, K>(
    rest: &R,
    shape: &S,
    skin: Option<&K>,
    mode: DeltaMode,
) -> Result<Array1<f64>, SampleError>
where
    R: PointGeometry,
    S: PointGeometry,
    K: PointGeometry,
{
    match (skin, mode) {
        (Some(skin), DeltaMode::PoseSpace) => pose_space_delta(rest, skin, shape),
        (Some(skin), DeltaMode::Plain) => {
            check_count(rest.point_count(), skin)?;
            plain_delta(skin, shape)
        }
        (None, _) => plain_delta(rest, shape),
    }
}

/// Flattened `position - rest` of a live geometry, using its own "rest" attribute.
pub fn position_delta<G: PointGeometry>(live: &G) -> Result<Array1<f64>, SampleError> {
    let rest = required_attribute(live, "live", REST_ATTRIBUTE)?;
    let count = live.point_count();
    let mut delta = Array1::zeros(3 * count);
    for index in 0..count {
        store(
            &mut delta,
            index,
            live.position(index) - attribute_vector(&rest, index),
        );
    }
    Ok(delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::PointSet;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn plain_delta_is_shape_minus_rest() {
        let rest = PointSet::from_points(&[[0.0, 0.0, 0.0]]);
        let shape = PointSet::from_points(&[[1.0, 2.0, 3.0]]);
        assert_eq!(plain_delta(&rest, &shape).unwrap(), array![1.0, 2.0, 3.0]);
    }

    #[test]
    fn skin_relative_delta_uses_skin_positions() {
        let rest = PointSet::from_points(&[[0.0, 0.0, 0.0]]);
        let shape = PointSet::from_points(&[[1.0, 2.0, 3.0]]);
        let skin = PointSet::from_points(&[[0.0, 0.0, 1.0]]);
        let delta = sample_displacement(&rest, &shape, Some(&skin), DeltaMode::Plain).unwrap();
        assert_eq!(delta, array![1.0, 2.0, 2.0]);
    }

    #[test]
    fn mismatched_counts_reject_the_whole_sample() {
        let rest = PointSet::from_points(&[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]]);
        let shape = PointSet::from_points(&[[1.0, 2.0, 3.0]]);
        assert_eq!(
            plain_delta(&rest, &shape),
            Err(SampleError::PointCountMismatch {
                expected: 2,
                found: 1
            })
        );

        let skin = PointSet::from_points(&[[0.0, 0.0, 0.0]]);
        let shape = PointSet::from_points(&[[0.0, 0.0, 0.0], [0.0, 0.0, 0.0]]);
        assert!(matches!(
            sample_displacement(&rest, &shape, Some(&skin), DeltaMode::Plain),
            Err(SampleError::PointCountMismatch { found: 1, .. })
        ));
    }

    #[test]
    fn dihedral_maps_from_onto_to() {
        let from = DVec3::new(1.0, 0.0, 0.0);
        let to = DVec3::new(0.0, 2.0, 0.0);
        let rotated = dihedral(from, to) * from;
        assert_abs_diff_eq!(rotated.x, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(rotated.y, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(rotated.z, 0.0, epsilon = 1e-12);
        assert_eq!(dihedral(DVec3::ZERO, to), DMat3::IDENTITY);
    }

    #[test]
    fn pose_space_delta_rotates_into_rest_frame() {
        // The skin frame is the rest frame turned 90 degrees about z.
        let rest = PointSet::from_points(&[[0.0, 0.0, 0.0]])
            .with_attribute(TANGENT_U_ATTRIBUTE, &[[1.0, 0.0, 0.0]])
            .unwrap()
            .with_attribute(TANGENT_V_ATTRIBUTE, &[[0.0, 0.0, 1.0]])
            .unwrap();
        let skin = PointSet::from_points(&[[5.0, 5.0, 5.0]])
            .with_attribute(TANGENT_U_ATTRIBUTE, &[[0.0, 1.0, 0.0]])
            .unwrap()
            .with_attribute(TANGENT_V_ATTRIBUTE, &[[0.0, 0.0, 1.0]])
            .unwrap();
        let shape = PointSet::from_points(&[[5.0, 6.0, 5.0]]);

        let delta = pose_space_delta(&rest, &skin, &shape).unwrap();
        assert_abs_diff_eq!(delta[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(delta[1], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(delta[2], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn pose_space_requires_tangents() {
        let rest = PointSet::from_points(&[[0.0, 0.0, 0.0]]);
        let skin = PointSet::from_points(&[[0.0, 0.0, 0.0]]);
        let shape = PointSet::from_points(&[[1.0, 0.0, 0.0]]);
        assert_eq!(
            sample_displacement(&rest, &shape, Some(&skin), DeltaMode::PoseSpace),
            Err(SampleError::MissingAttribute {
                role: "rest",
                attribute: TANGENT_U_ATTRIBUTE
            })
        );
    }

    #[test]
    fn position_delta_needs_rest_attribute() {
        let live = PointSet::from_points(&[[2.0, 2.0, 2.0]]);
        assert!(matches!(
            position_delta(&live),
            Err(SampleError::MissingAttribute { .. })
        ));

        let live = live
            .with_attribute(REST_ATTRIBUTE, &[[1.0, 0.0, 2.0]])
            .unwrap();
        assert_eq!(position_delta(&live).unwrap(), array![1.0, 2.0, 0.0]);
    }
}
