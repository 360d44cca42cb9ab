// Differential-drive kinematics
// Converts wheel encoder ticks into body-frame motion increments.

use std::f64::consts::{PI, TAU};

/// Distance travelled by each wheel over one sample (metres)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WheelTravel {
    pub left: f64,
    pub right: f64,
}

/// Body motion over one sample
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BodyIncrement {
    /// Arc length travelled by the base centre (m)
    pub distance: f64,
    /// Heading change (rad, positive = counter-clockwise)
    pub rotation: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiffDrive {
    /// Distance between the wheels (m)
    pub wheel_base: f64,
    /// Encoder-to-distance scale (m per tick)
    pub distance_per_tick: f64,
}

impl DiffDrive {
    pub fn new(wheel_base: f64, distance_per_tick: f64) -> Self {
        Self {
            wheel_base,
            distance_per_tick,
        }
    }

    pub fn wheel_travel(&self, left_ticks: i64, right_ticks: i64) -> WheelTravel {
        WheelTravel {
            left: left_ticks as f64 * self.distance_per_tick,
            right: right_ticks as f64 * self.distance_per_tick,
        }
    }

    pub fn body_increment(&self, travel: WheelTravel) -> BodyIncrement {
        BodyIncrement {
            distance: (travel.left + travel.right) / 2.0,
            rotation: (travel.right - travel.left) / self.wheel_base,
        }
    }
}

/// Wrap an angle into (-pi, pi]
pub fn normalize_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(TAU) - PI;
    if wrapped == -PI { PI } else { wrapped }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive() -> DiffDrive {
        DiffDrive::new(0.3, 0.001)
    }

    #[test]
    fn test_straight_line() {
        let travel = drive().wheel_travel(100, 100);
        assert!((travel.left - 0.1).abs() < 1e-12);
        let inc = drive().body_increment(travel);
        assert!((inc.distance - 0.1).abs() < 1e-12);
        assert_eq!(inc.rotation, 0.0);
    }

    #[test]
    fn test_turn_in_place() {
        // right wheel forward, left backward -> counter-clockwise
        let inc = drive().body_increment(drive().wheel_travel(-150, 150));
        assert_eq!(inc.distance, 0.0);
        assert!((inc.rotation - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_arc() {
        let inc = drive().body_increment(WheelTravel {
            left: 0.1,
            right: 0.16,
        });
        assert!((inc.distance - 0.13).abs() < 1e-12);
        assert!((inc.rotation - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_normalize_angle() {
        assert!((normalize_angle(3.0 * PI / 2.0) + PI / 2.0).abs() < 1e-12);
        assert!((normalize_angle(-3.0 * PI / 2.0) - PI / 2.0).abs() < 1e-12);
        assert_eq!(normalize_angle(-PI), PI);
        assert_eq!(normalize_angle(PI), PI);
        assert!((normalize_angle(0.25) - 0.25).abs() < 1e-15);
    }
}
