//! 情绪 / 注意力状态
//!
//! 三个维度（无聊、愉悦、精力）都钳制在 [0, 1]；主动循环每拍自然衰减一次，
//! 动作执行后按动作类别微调。快照数值保留三位小数后拼入提示词。

use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AffectSnapshot {
    pub boredom: f64,
    pub happiness: f64,
    pub energy: f64,
}

impl AffectSnapshot {
    pub fn to_prompt_section(&self) -> String {
        format!(
            "## Mood\n- boredom: {}\n- happiness: {}\n- energy: {}\n",
            self.boredom, self.happiness, self.energy
        )
    }
}

#[derive(Clone, Debug)]
pub struct AffectState {
    boredom: f64,
    happiness: f64,
    energy: f64,
    decay_rate: f64,
}

impl Default for AffectState {
    fn default() -> Self {
        Self {
            boredom: 0.2,
            happiness: 0.6,
            energy: 0.8,
            decay_rate: 0.02,
        }
    }
}

impl AffectState {
    pub fn new() -> Self {
        Self::default()
    }

    /// 只观察不行动：越等越无聊
    pub fn on_observe_only(&mut self, seconds: f64) {
        self.boredom += 0.05 + (seconds / 300.0).min(0.1);
        self.energy -= 0.02;
        self.clamp();
    }

    pub fn on_behavior(&mut self, behavior: &str) {
        let name = behavior.to_lowercase();
        if name.contains("sleep") {
            self.energy += 0.2;
            self.boredom -= 0.1;
        } else if ["dance", "jump", "run", "climb"]
            .iter()
            .any(|k| name.contains(k))
        {
            self.energy -= 0.05;
            self.boredom -= 0.08;
            self.happiness += 0.05;
        } else if name.contains("sit") || name.contains("idle") {
            self.boredom += 0.02;
        } else {
            self.boredom -= 0.01;
        }
        self.clamp();
    }

    pub fn on_dialogue(&mut self) {
        self.happiness += 0.04;
        self.boredom -= 0.04;
        self.clamp();
    }

    pub fn natural_decay(&mut self) {
        self.boredom -= self.decay_rate;
        self.happiness -= self.decay_rate / 2.0;
        self.energy -= self.decay_rate / 3.0;
        self.clamp();
    }

    pub fn snapshot(&self) -> AffectSnapshot {
        AffectSnapshot {
            boredom: round3(self.boredom),
            happiness: round3(self.happiness),
            energy: round3(self.energy),
        }
    }

    fn clamp(&mut self) {
        self.boredom = self.boredom.clamp(0.0, 1.0);
        self.happiness = self.happiness.clamp(0.0, 1.0);
        self.energy = self.energy.clamp(0.0, 1.0);
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = AffectState::new().snapshot();
        assert_eq!(s.boredom, 0.2);
        assert_eq!(s.happiness, 0.6);
        assert_eq!(s.energy, 0.8);
    }

    #[test]
    fn test_values_stay_clamped() {
        let mut a = AffectState::new();
        for _ in 0..100 {
            a.on_observe_only(600.0);
        }
        let s = a.snapshot();
        assert_eq!(s.boredom, 1.0);
        assert_eq!(s.energy, 0.0);

        for _ in 0..100 {
            a.natural_decay();
        }
        assert_eq!(a.snapshot().boredom, 0.0);
    }

    #[test]
    fn test_sleep_restores_energy() {
        let mut a = AffectState::new();
        a.on_observe_only(0.0);
        let before = a.snapshot().energy;
        a.on_behavior("Sleep");
        assert!(a.snapshot().energy > before);
    }

    #[test]
    fn test_dialogue_lifts_mood() {
        let mut a = AffectState::new();
        a.on_dialogue();
        let s = a.snapshot();
        assert_eq!(s.happiness, 0.64);
        assert_eq!(s.boredom, 0.16);
    }
}
