//! Volume meter for the inbound (assistant) audio stream.

/// Source of time-domain samples from an inbound media track.
pub trait AudioProbe: Send {
    /// Latest window of samples in the range [-1.0, 1.0].
    fn time_domain(&mut self) -> Vec<f32>;
}

/// Root-mean-square level of a sample window, clamped to [0, 1].
pub fn rms_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt().clamp(0.0, 1.0)
}

#[derive(Default)]
pub struct VolumeMeter {
    probe: Option<Box<dyn AudioProbe>>,
    level: f32,
}

impl VolumeMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, probe: Box<dyn AudioProbe>) {
        self.probe = Some(probe);
    }

    pub fn is_attached(&self) -> bool {
        self.probe.is_some()
    }

    /// Take one reading; returns the new level.
    pub fn sample(&mut self) -> f32 {
        if let Some(probe) = self.probe.as_mut() {
            self.level = rms_level(&probe.time_domain());
        }
        self.level
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    /// Drop the probe and zero the level.
    pub fn detach(&mut self) {
        self.probe = None;
        self.level = 0.0;
    }
}

impl std::fmt::Debug for VolumeMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeMeter")
            .field("attached", &self.is_attached())
            .field("level", &self.level)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Constant(Vec<f32>);

    impl AudioProbe for Constant {
        fn time_domain(&mut self) -> Vec<f32> {
            self.0.clone()
        }
    }

    #[test]
    fn test_rms_bounds() {
        assert_eq!(rms_level(&[]), 0.0);
        assert_eq!(rms_level(&[0.0; 64]), 0.0);
        assert!((rms_level(&[1.0, -1.0]) - 1.0).abs() < f32::EPSILON);
        assert_eq!(rms_level(&[4.0, -4.0]), 1.0);
        assert!((rms_level(&[0.5, -0.5, 0.5, -0.5]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_meter_samples_and_detaches() {
        let mut meter = VolumeMeter::new();
        assert_eq!(meter.sample(), 0.0);

        meter.attach(Box::new(Constant(vec![0.5, -0.5])));
        assert!((meter.sample() - 0.5).abs() < 1e-6);
        assert!((meter.level() - 0.5).abs() < 1e-6);

        meter.detach();
        assert!(!meter.is_attached());
        assert_eq!(meter.level(), 0.0);
        assert_eq!(meter.sample(), 0.0);
    }
}
