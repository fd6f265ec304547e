// Scene objects and camera
//
// Renderable entities with a transform, a shared model handle, and a color.
// Consumed by render systems; the frame core never touches these.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use glam::{EulerRot, Mat3, Mat4, Vec3};

use crate::backend::model::Model;

/// Translation, non-uniform scale, and Tait-Bryan YXZ rotation.
#[derive(Clone, Debug)]
pub struct TransformComponent {
    pub translation: Vec3,
    pub scale: Vec3,
    /// Euler angles in radians, applied as Y, then X, then Z
    pub rotation: Vec3,
}

impl Default for TransformComponent {
    fn default() -> Self {
        Self {
            translation: Vec3::ZERO,
            scale: Vec3::ONE,
            rotation: Vec3::ZERO,
        }
    }
}

impl TransformComponent {
    /// Model matrix: Translate * Ry * Rx * Rz * Scale.
    pub fn mat4(&self) -> Mat4 {
        Mat4::from_translation(self.translation)
            * Mat4::from_euler(
                EulerRot::YXZ,
                self.rotation.y,
                self.rotation.x,
                self.rotation.z,
            )
            * Mat4::from_scale(self.scale)
    }

    /// Inverse-transpose of the model matrix's rotation/scale part, for
    /// transforming normals under non-uniform scale.
    pub fn normal_matrix(&self) -> Mat3 {
        Mat3::from_euler(
            EulerRot::YXZ,
            self.rotation.y,
            self.rotation.x,
            self.rotation.z,
        ) * Mat3::from_diagonal(self.scale.recip())
    }
}

static NEXT_OBJECT_ID: AtomicU32 = AtomicU32::new(0);

/// A renderable entity: unique id, shared mesh, color, transform.
pub struct GameObject {
    id: u32,
    pub model: Option<Arc<Model>>,
    pub color: Vec3,
    pub transform: TransformComponent,
}

impl GameObject {
    /// Ids are assigned monotonically and never reused.
    pub fn new() -> Self {
        Self {
            id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            model: None,
            color: Vec3::ONE,
            transform: TransformComponent::default(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Default for GameObject {
    fn default() -> Self {
        Self::new()
    }
}

/// Camera with Vulkan-convention projection (0..1 depth, Y flipped).
#[derive(Clone, Debug, Default)]
pub struct Camera {
    projection: Mat4,
    view: Mat4,
}

impl Camera {
    pub fn new() -> Self {
        Self {
            projection: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
        }
    }

    pub fn set_perspective_projection(&mut self, fov_y: f32, aspect: f32, near: f32, far: f32) {
        let mut projection = Mat4::perspective_rh(fov_y, aspect, near, far);
        // glam targets GL-style clip space with +Y up; Vulkan's is +Y down
        projection.y_axis.y *= -1.0;
        self.projection = projection;
    }

    /// Look from `position` towards `target`.
    pub fn set_view_target(&mut self, position: Vec3, target: Vec3, up: Vec3) {
        self.view = Mat4::look_at_rh(position, target, up);
    }

    /// View from a position and YXZ Euler orientation, matching
    /// [`TransformComponent`] rotations.
    pub fn set_view_yxz(&mut self, position: Vec3, rotation: Vec3) {
        let camera_to_world = Mat4::from_translation(position)
            * Mat4::from_euler(EulerRot::YXZ, rotation.y, rotation.x, rotation.z);
        self.view = camera_to_world.inverse();
    }

    pub fn projection(&self) -> Mat4 {
        self.projection
    }

    pub fn view(&self) -> Mat4 {
        self.view
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_mat4_eq(a: Mat4, b: Mat4) {
        assert!(
            a.abs_diff_eq(b, 1e-5),
            "matrices differ:\n{:?}\n{:?}",
            a,
            b
        );
    }

    #[test]
    fn identity_transform_is_identity_matrix() {
        let transform = TransformComponent::default();
        assert_mat4_eq(transform.mat4(), Mat4::IDENTITY);
    }

    #[test]
    fn translation_lands_in_last_column() {
        let transform = TransformComponent {
            translation: Vec3::new(1.0, -2.0, 3.0),
            ..Default::default()
        };
        let m = transform.mat4();
        assert_eq!(m.w_axis.truncate(), Vec3::new(1.0, -2.0, 3.0));
    }

    #[test]
    fn rotation_order_is_y_then_x_then_z() {
        let transform = TransformComponent {
            rotation: Vec3::new(0.3, 0.7, -0.2),
            ..Default::default()
        };
        let expected = Mat4::from_rotation_y(0.7)
            * Mat4::from_rotation_x(0.3)
            * Mat4::from_rotation_z(-0.2);
        assert_mat4_eq(transform.mat4(), expected);
    }

    #[test]
    fn normal_matrix_undoes_non_uniform_scale() {
        let transform = TransformComponent {
            scale: Vec3::new(2.0, 1.0, 4.0),
            ..Default::default()
        };
        let n = transform.normal_matrix();
        assert!(n.x_axis.abs_diff_eq(glam::Vec3::new(0.5, 0.0, 0.0), 1e-5));
        assert!(n.z_axis.abs_diff_eq(glam::Vec3::new(0.0, 0.0, 0.25), 1e-5));
    }

    #[test]
    fn object_ids_are_unique_and_increasing() {
        let a = GameObject::new();
        let b = GameObject::new();
        let c = GameObject::new();
        assert!(a.id() < b.id());
        assert!(b.id() < c.id());
    }

    #[test]
    fn perspective_projection_flips_y_for_vulkan() {
        let mut camera = Camera::new();
        camera.set_perspective_projection(std::f32::consts::FRAC_PI_4, 16.0 / 9.0, 0.1, 100.0);
        assert!(camera.projection().y_axis.y < 0.0);
    }

    #[test]
    fn view_target_looks_down_the_target_axis() {
        let mut camera = Camera::new();
        camera.set_view_target(Vec3::new(0.0, 0.0, -5.0), Vec3::ZERO, Vec3::Y);
        // The target point ends up on the negative view-space Z axis
        let p = camera.view().transform_point3(Vec3::ZERO);
        assert!(p.z < 0.0);
        assert!(p.x.abs() < 1e-5 && p.y.abs() < 1e-5);
    }
}
