use crate::config::{AXIS_COUNT, AXIS_X, AXIS_Y, AXIS_Z, STEPPER_COUNT};
use crate::settings::Settings;

pub type AxisVec = [f64; AXIS_COUNT];
pub type StepVec = [i32; STEPPER_COUNT];

/// Maps machine coordinates to actuator steps and back.
pub trait Kinematics {
    fn apply_inverse(&self, settings: &Settings, axis: &AxisVec) -> StepVec;
    fn apply_forward(&self, settings: &Settings, steps: &StepVec) -> AxisVec;

    /// Machine-frame correction applied to every programmed target before
    /// inverse kinematics (skew, bed levelling).
    fn apply_transform(&self, _axis: &mut AxisVec) {}
    fn apply_reverse_transform(&self, _axis: &mut AxisVec) {}

    /// Axes in the order they are homed.
    fn homing_order(&self) -> &'static [usize];

    fn name(&self) -> &'static str;
}

/// One stepper per axis.
#[derive(Debug, Default, Clone, Copy)]
pub struct Cartesian;

impl Kinematics for Cartesian {
    fn apply_inverse(&self, settings: &Settings, axis: &AxisVec) -> StepVec {
        let mut steps = [0; STEPPER_COUNT];
        for (i, s) in steps.iter_mut().enumerate().take(AXIS_COUNT) {
            *s = (settings.step_per_mm[i] * axis[i]).round() as i32;
        }
        steps
    }

    fn apply_forward(&self, settings: &Settings, steps: &StepVec) -> AxisVec {
        let mut axis = [0.0; AXIS_COUNT];
        for (i, a) in axis.iter_mut().enumerate() {
            let spm = settings.step_per_mm[i];
            *a = if spm != 0.0 { steps[i] as f64 / spm } else { 0.0 };
        }
        axis
    }

    fn homing_order(&self) -> &'static [usize] {
        &[AXIS_Z, AXIS_X, AXIS_Y]
    }

    fn name(&self) -> &'static str {
        "cartesian"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64) {
        assert!(
            (a - b).abs() <= 1e-6,
            "expected {:.6}, got {:.6} (|diff|={:.6})",
            b,
            a,
            (a - b).abs()
        );
    }

    #[test]
    fn inverse_rounds_to_nearest_step() {
        let s = Settings::default();
        let steps = Cartesian.apply_inverse(&s, &[1.0, -0.0026, 0.0024]);
        assert_eq!(steps, [200, -1, 0]);
    }

    #[test]
    fn forward_undoes_inverse_on_step_grid() {
        let mut s = Settings::default();
        s.step_per_mm[2] = 400.0;
        let axis = Cartesian.apply_forward(&s, &[300, -50, 1000]);
        approx_eq(axis[0], 1.5);
        approx_eq(axis[1], -0.25);
        approx_eq(axis[2], 2.5);
        assert_eq!(Cartesian.apply_inverse(&s, &axis), [300, -50, 1000]);
    }

    #[test]
    fn homes_z_before_xy() {
        assert_eq!(Cartesian.homing_order()[0], AXIS_Z);
    }
}
