//! Pointer acceleration.
//!
//! Scales a motion vector by a velocity dependent factor so slow motions
//! gain precision and fast motions gain reach. Velocity is estimated from a
//! ring of recent displacement samples; the estimate only spans samples that
//! kept moving in a compatible direction within a short time window, so a
//! direction reversal starts a fresh estimate instead of averaging over the
//! turn.

use std::f64::consts::PI;

/// Unitless default multiplier applied to velocities before profiling.
const DEFAULT_CONSTANT_ACCELERATION: f64 = 10.0;
const DEFAULT_THRESHOLD: f64 = 4.0;
const DEFAULT_ACCELERATION: f64 = 2.0;

const MAX_VELOCITY_DIFF: f64 = 1.0; /* units/ms */
const MOTION_TIMEOUT: u64 = 300; /* ms */
const NUM_POINTER_TRACKERS: usize = 16;

bitflags::bitflags! {
    /// Compass octants a displacement may fall into.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct Direction: u32 {
        const N  = 1 << 0;
        const NE = 1 << 1;
        const E  = 1 << 2;
        const SE = 1 << 3;
        const S  = 1 << 4;
        const SW = 1 << 5;
        const W  = 1 << 6;
        const NW = 1 << 7;
    }
}

const UNDEFINED_DIRECTION: Direction = Direction::all();

/// Classifies a displacement into one or two adjacent octants, or a broader
/// three-octant fan for very small magnitudes.
fn get_direction(dx: f64, dy: f64) -> Direction {
    let (dx, dy) = (dx as i32, dy as i32);

    if dx.abs() < 2 && dy.abs() < 2 {
        use self::Direction as D;
        if dx > 0 && dy > 0 {
            D::S | D::SE | D::E
        } else if dx > 0 && dy < 0 {
            D::N | D::NE | D::E
        } else if dx < 0 && dy > 0 {
            D::S | D::SW | D::W
        } else if dx < 0 && dy < 0 {
            D::N | D::NW | D::W
        } else if dx > 0 {
            D::NE | D::E | D::SE
        } else if dx < 0 {
            D::NW | D::W | D::SW
        } else if dy > 0 {
            D::SE | D::S | D::SW
        } else if dy < 0 {
            D::NE | D::N | D::NW
        } else {
            UNDEFINED_DIRECTION
        }
    } else {
        // Rotate atan2 so that North is 0, map [0, 2π) onto [0, 8) and mark
        // one or two close enough octants.
        let mut r = (dy as f64).atan2(dx as f64);
        r = (r + 2.5 * PI).rem_euclid(2.0 * PI);
        r *= 4.0 / PI;

        let d1 = (r + 0.9) as u32 % 8;
        let d2 = (r + 0.1) as u32 % 8;

        Direction::from_bits_truncate((1 << d1) | (1 << d2))
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PointerTracker {
    dx: f64,
    dy: f64,
    time: u64,
    dir: Direction,
}

/// A motion vector, in device units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionParams {
    /// Motion along the x axis.
    pub dx: f64,
    /// Motion along the y axis.
    pub dy: f64,
}

/// The pointer acceleration filter.
///
/// Tracker slot `k` accumulates the total displacement over the last `k`
/// insertions, which lets the velocity estimate span a variable number of
/// recent frames without re-summing.
#[derive(Debug)]
pub(crate) struct PointerAccelerator {
    last_velocity: f64,
    trackers: [PointerTracker; NUM_POINTER_TRACKERS],
    cur_tracker: usize,
    threshold: f64,
    accel: f64,
    speed: f64,
}

impl PointerAccelerator {
    pub(crate) fn new() -> PointerAccelerator {
        PointerAccelerator {
            last_velocity: 0.0,
            trackers: [PointerTracker::default(); NUM_POINTER_TRACKERS],
            cur_tracker: 0,
            threshold: DEFAULT_THRESHOLD,
            accel: DEFAULT_ACCELERATION,
            speed: 0.0,
        }
    }

    fn feed_trackers(&mut self, dx: f64, dy: f64, time: u64) {
        for tracker in &mut self.trackers {
            tracker.dx += dx;
            tracker.dy += dy;
        }

        let current = (self.cur_tracker + 1) % NUM_POINTER_TRACKERS;
        self.cur_tracker = current;

        self.trackers[current] = PointerTracker {
            dx: 0.0,
            dy: 0.0,
            time,
            dir: get_direction(dx, dy),
        };
    }

    fn tracker_by_offset(&self, offset: usize) -> &PointerTracker {
        let index = (self.cur_tracker + NUM_POINTER_TRACKERS - offset) % NUM_POINTER_TRACKERS;
        &self.trackers[index]
    }

    fn tracker_velocity(tracker: &PointerTracker, time: u64) -> f64 {
        let dx = f64::from(tracker.dx as i32);
        let dy = f64::from(tracker.dy as i32);
        let distance = (dx * dx + dy * dy).sqrt();
        distance / (time - tracker.time) as f64
    }

    /// Walks trackers from most recent to oldest, stopping on a timeout,
    /// clock regression, direction change or too large a velocity
    /// divergence. Returns the last accepted tracker's velocity in
    /// units/ms.
    fn calculate_velocity(&self, time: u64) -> f64 {
        let mut result = 0.0;
        let mut initial_velocity = 0.0;

        let mut dir = self.tracker_by_offset(0).dir;

        for offset in 1..NUM_POINTER_TRACKERS {
            let tracker = self.tracker_by_offset(offset);

            if tracker.time > time || time - tracker.time > MOTION_TIMEOUT {
                break;
            }

            dir &= tracker.dir;
            if dir.is_empty() {
                break;
            }

            let velocity = Self::tracker_velocity(tracker, time);

            if initial_velocity == 0.0 {
                initial_velocity = velocity;
                result = velocity;
            } else {
                if (initial_velocity - velocity).abs() > MAX_VELOCITY_DIFF {
                    break;
                }
                result = velocity;
            }
        }

        result
    }

    /// The smooth-simple acceleration profile: unity around the threshold,
    /// eased towards zero below it and towards the ceiling above it through
    /// the penumbral gradient.
    fn profile(&self, velocity: f64) -> f64 {
        let threshold = self.threshold.max(1.0);
        let accel = self.accel.max(1.0);
        // Increasing this makes reaching max accel take longer (min 1.0).
        let stretch = 3.0;

        let mut velocity = velocity * DEFAULT_CONSTANT_ACCELERATION;

        if velocity < threshold / 2.0 {
            return calc_penumbral_gradient(0.5 + velocity / threshold) * 2.0 - 1.0;
        }

        if velocity <= threshold {
            return 1.0;
        }

        velocity /= threshold;
        if velocity < accel {
            // Velocity is 1.0 - accel, scale this to 0.0 - 0.5.
            velocity = 0.5 * (velocity - 1.0) / (accel - 1.0);
        } else if velocity < accel * stretch {
            // Velocity is accel - (accel * stretch), scale this to 0.5 - 1.0.
            velocity = 0.5 + 0.5 * (velocity - accel) / (accel * (stretch - 1.0));
        } else {
            return accel;
        }

        1.0 + calc_penumbral_gradient(velocity) * (accel - 1.0)
    }

    /// Simpson's rule over the profile at the previous, mean and current
    /// velocity.
    fn calculate_acceleration(&self, velocity: f64) -> f64 {
        let factor = self.profile(velocity)
            + self.profile(self.last_velocity)
            + 4.0 * self.profile((self.last_velocity + velocity) / 2.0);

        factor / 6.0
    }

    /// Applies the filter to one motion vector.
    pub(crate) fn filter(&mut self, motion: &mut MotionParams, time: u64) {
        self.feed_trackers(motion.dx, motion.dy, time);
        let velocity = self.calculate_velocity(time);
        let accel_value = self.calculate_acceleration(velocity);

        motion.dx *= accel_value;
        motion.dy *= accel_value;

        self.last_velocity = velocity;
    }

    /// Sets the speed knob. `speed` must be in `[-1, 1]`; it is quantized
    /// onto an 11-step profile table and the quantized value is stored back.
    pub(crate) fn set_speed(&mut self, speed: f64) {
        const LUT: [(f64, f64); 11] = [
            (10.0, 0.7),
            (8.0, 0.9),
            (7.0, 1.0),
            (6.0, 1.4),
            (5.0, 1.7),
            (DEFAULT_THRESHOLD, DEFAULT_ACCELERATION),
            (3.0, 2.5),
            (2.0, 3.0),
            (1.0, 4.0),
            (1.0, 5.0),
            (1.0, 6.0),
        ];

        debug_assert!((-1.0..=1.0).contains(&speed));
        let speed = speed.clamp(-1.0, 1.0);

        let idx = ((speed + 1.0) / 2.0 * 10.0) as usize;
        let (threshold, accel) = LUT[idx];
        self.threshold = threshold;
        self.accel = accel;

        self.speed = idx as f64 / 10.0 * 2.0 - 1.0;
    }

    /// The quantized speed setting.
    pub(crate) fn speed(&self) -> f64 {
        self.speed
    }
}

/// `G(x) = 0.5 + (x·√(1−x²) + asin(x)) / π` rescaled onto `[0, 1]`.
fn calc_penumbral_gradient(x: f64) -> f64 {
    let x = x * 2.0 - 1.0;
    0.5 + (x * (1.0 - x * x).sqrt() + x.asin()) / PI
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn direction_octants() {
        assert_eq!(get_direction(5.0, 0.0), Direction::E);
        assert_eq!(get_direction(-5.0, 0.0), Direction::W);
        assert_eq!(get_direction(0.0, 5.0), Direction::S);
        assert_eq!(get_direction(0.0, -5.0), Direction::N);
        // Opposite octants never share bits.
        assert!((get_direction(7.0, 0.0) & get_direction(-7.0, 0.0)).is_empty());
    }

    #[test]
    fn direction_small_magnitude_fans_out() {
        let dir = get_direction(1.0, 0.0);
        assert_eq!(dir, Direction::NE | Direction::E | Direction::SE);
        let dir = get_direction(0.0, 1.0);
        assert_eq!(dir, Direction::SE | Direction::S | Direction::SW);
    }

    #[test]
    fn profile_is_unity_between_half_and_full_threshold() {
        let accel = PointerAccelerator::new();
        // threshold 4.0: normalized velocities in [2, 4] map to 1.0.
        assert_eq!(accel.profile(0.2), 1.0);
        assert_eq!(accel.profile(0.4), 1.0);
        assert!(accel.profile(0.05) < 1.0);
        assert!(accel.profile(1.0) > 1.0);
    }

    #[test]
    fn profile_clamps_at_ceiling() {
        let accel = PointerAccelerator::new();
        // v' >= 3·A·T, with T=4 and A=2: v' = 24, v = 2.4.
        assert_eq!(accel.profile(3.0), 2.0);
    }

    #[test]
    fn filter_preserves_sign() {
        let mut accel = PointerAccelerator::new();
        let mut time = 1000;
        for _ in 0..10 {
            let mut motion = MotionParams { dx: 7.0, dy: -3.0 };
            accel.filter(&mut motion, time);
            assert!(motion.dx > 0.0);
            assert!(motion.dy < 0.0);
            time += 12;
        }
    }

    #[test]
    fn direction_change_discards_older_trackers() {
        let mut accel = PointerAccelerator::new();
        let mut time = 1000;
        for _ in 0..4 {
            let mut motion = MotionParams { dx: 5.0, dy: 0.0 };
            accel.filter(&mut motion, time);
            time += 10;
        }

        // Sustained rightward motion spans several trackers.
        assert!(accel.calculate_velocity(time) > 0.0);

        let mut motion = MotionParams { dx: -5.0, dy: 0.0 };
        accel.filter(&mut motion, time);

        // After the reversal the scan stops at the first tracker whose
        // direction mask (E) ANDs to zero against the new insertion (W), so
        // none of the rightward history contributes to the estimate.
        assert_eq!(accel.calculate_velocity(time + 10), 0.0);
    }

    #[test]
    fn velocity_zero_without_recent_motion() {
        let mut accel = PointerAccelerator::new();
        let mut motion = MotionParams { dx: 5.0, dy: 0.0 };
        accel.filter(&mut motion, 1000);
        // Past the motion timeout every tracker is stale.
        assert_eq!(accel.calculate_velocity(2000), 0.0);
    }

    #[test]
    fn speed_knob_quantizes() {
        let mut accel = PointerAccelerator::new();

        accel.set_speed(-1.0);
        assert_eq!((accel.threshold, accel.accel), (10.0, 0.7));
        assert_eq!(accel.speed(), -1.0);

        accel.set_speed(0.0);
        assert_eq!(
            (accel.threshold, accel.accel),
            (DEFAULT_THRESHOLD, DEFAULT_ACCELERATION)
        );

        accel.set_speed(1.0);
        assert_eq!((accel.threshold, accel.accel), (1.0, 6.0));
        assert_eq!(accel.speed(), 1.0);

        accel.set_speed(0.06);
        assert_eq!(accel.speed(), 0.0);
    }
}
