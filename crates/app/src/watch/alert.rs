use ml_core::Detection;
use serde::Serialize;

/// Per-frame alert classification.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub(crate) enum AlertState {
    #[default]
    #[serde(rename = "Monitoring")]
    Monitoring,
    #[serde(rename = "INTRUDER DETECTED")]
    Alert,
}

impl AlertState {
    pub(crate) fn is_alert(self) -> bool {
        matches!(self, AlertState::Alert)
    }

    /// Text shown in the frame banner.
    pub(crate) fn banner(self) -> &'static str {
        match self {
            AlertState::Monitoring => "STATUS: MONITORING",
            AlertState::Alert => "STATUS: INTRUDER DETECTED",
        }
    }
}

/// Decides which detections count as an intruder.
#[derive(Clone, Debug)]
pub(crate) struct AlertRule {
    target_label: String,
    threshold: f32,
}

impl AlertRule {
    pub(crate) fn new(target_label: impl Into<String>, threshold: f32) -> Self {
        Self {
            target_label: target_label.into(),
            threshold,
        }
    }

    /// Detections with the target label and confidence strictly above the threshold.
    pub(crate) fn qualifying<'a>(&self, detections: &'a [Detection]) -> Vec<&'a Detection> {
        detections
            .iter()
            .filter(|det| det.label == self.target_label && det.confidence > self.threshold)
            .collect()
    }
}

pub(crate) fn state_for(qualifying: &[&Detection]) -> AlertState {
    if qualifying.is_empty() {
        AlertState::Monitoring
    } else {
        AlertState::Alert
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(label: &str, confidence: f32) -> Detection {
        Detection {
            label: label.into(),
            confidence,
            bbox: [0.0, 0.0, 10.0, 10.0],
        }
    }

    fn classify(rule: &AlertRule, detections: &[Detection]) -> AlertState {
        state_for(&rule.qualifying(detections))
    }

    #[test]
    fn alert_requires_target_label_above_threshold() {
        let rule = AlertRule::new("person", 0.5);
        assert_eq!(classify(&rule, &[]), AlertState::Monitoring);
        assert_eq!(classify(&rule, &[det("dog", 0.99)]), AlertState::Monitoring);
        assert_eq!(classify(&rule, &[det("person", 0.3)]), AlertState::Monitoring);
        assert_eq!(
            classify(&rule, &[det("dog", 0.9), det("person", 0.51)]),
            AlertState::Alert
        );
    }

    #[test]
    fn confidence_equal_to_threshold_does_not_qualify() {
        let rule = AlertRule::new("person", 0.5);
        assert!(rule.qualifying(&[det("person", 0.5)]).is_empty());
    }

    #[test]
    fn serializes_wire_strings() {
        assert_eq!(
            serde_json::to_string(&AlertState::Monitoring).unwrap(),
            "\"Monitoring\""
        );
        assert_eq!(
            serde_json::to_string(&AlertState::Alert).unwrap(),
            "\"INTRUDER DETECTED\""
        );
    }
}
