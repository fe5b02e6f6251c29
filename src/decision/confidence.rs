//! 置信度模型
//!
//! confidence = Σ weight_i × factor_i，五个权重之和必须为 1.0。
//! 因子与结果都会被裁剪到 [0, 1]（NaN 视为 0），所以任意输入下结果都在 [0, 1]。

use serde::Deserialize;
use serde_json::Value;

use crate::core::ConfigError;
use crate::decision::history::DecisionHistory;
use crate::decision::types::{ConfidenceFactors, RoutingLevel};
use crate::invoker::InvocationOptions;

const WEIGHT_TOLERANCE: f64 = 1e-6;

/// 五个因子的权重
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConfidenceWeights {
    pub history: f64,
    pub validation: f64,
    pub coverage: f64,
    pub accuracy: f64,
    pub complexity: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            history: 0.30,
            validation: 0.25,
            coverage: 0.20,
            accuracy: 0.15,
            complexity: 0.10,
        }
    }
}

impl ConfidenceWeights {
    pub fn sum(&self) -> f64 {
        self.history + self.validation + self.coverage + self.accuracy + self.complexity
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let all = [
            self.history,
            self.validation,
            self.coverage,
            self.accuracy,
            self.complexity,
        ];
        let sum = self.sum();
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) || (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(ConfigError::InvalidWeights(sum));
        }
        Ok(())
    }
}

/// 路由阈值：fully_automatic ≥ notification ≥ preview
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RoutingThresholds {
    pub fully_automatic: f64,
    pub notification: f64,
    pub preview: f64,
}

impl Default for RoutingThresholds {
    fn default() -> Self {
        Self {
            fully_automatic: 0.95,
            notification: 0.80,
            preview: 0.65,
        }
    }
}

impl RoutingThresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let in_range = |t: f64| (0.0..=1.0).contains(&t);
        if !(in_range(self.fully_automatic) && in_range(self.notification) && in_range(self.preview))
            || self.fully_automatic < self.notification
            || self.notification < self.preview
        {
            return Err(ConfigError::InvalidThresholds(format!(
                "{} / {} / {}",
                self.fully_automatic, self.notification, self.preview
            )));
        }
        Ok(())
    }
}

/// 裁剪到 [0, 1]，NaN 视为 0
pub fn normalize(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone)]
pub struct ConfidenceModel {
    weights: ConfidenceWeights,
    thresholds: RoutingThresholds,
}

impl ConfidenceModel {
    pub fn new(weights: ConfidenceWeights, thresholds: RoutingThresholds) -> Result<Self, ConfigError> {
        weights.validate()?;
        thresholds.validate()?;
        Ok(Self { weights, thresholds })
    }

    pub fn weights(&self) -> &ConfidenceWeights {
        &self.weights
    }

    /// 从历史与上下文提取因子
    ///
    /// 上下文键：`validation_strength`（数值）或 `prerequisites_validated`（布尔）、
    /// `coverage`（比例，大于 1 视为百分数）、`complexity`（缺省 0.5）。
    pub fn factors(
        &self,
        history: &DecisionHistory,
        role: &str,
        action: &str,
        context: &InvocationOptions,
    ) -> ConfidenceFactors {
        let validation = match context.get("validation_strength").and_then(Value::as_f64) {
            Some(v) => v,
            None => match context.get("prerequisites_validated").and_then(Value::as_bool) {
                Some(true) => 1.0,
                _ => 0.0,
            },
        };
        let coverage = context
            .get("coverage")
            .and_then(Value::as_f64)
            .map(|c| if c > 1.0 { c / 100.0 } else { c })
            .unwrap_or(0.0);
        let complexity = context
            .get("complexity")
            .and_then(Value::as_f64)
            .unwrap_or(0.5);

        ConfidenceFactors {
            history: normalize(history.success_rate(role, action)),
            validation: normalize(validation),
            coverage: normalize(coverage),
            accuracy: normalize(history.role_accuracy(role)),
            simplicity: normalize(1.0 - normalize(complexity)),
        }
    }

    pub fn score(&self, factors: &ConfidenceFactors) -> f64 {
        let w = &self.weights;
        let total = w.history * normalize(factors.history)
            + w.validation * normalize(factors.validation)
            + w.coverage * normalize(factors.coverage)
            + w.accuracy * normalize(factors.accuracy)
            + w.complexity * normalize(factors.simplicity);
        normalize(total)
    }

    pub fn level(&self, confidence: f64) -> RoutingLevel {
        let t = &self.thresholds;
        if confidence >= t.fully_automatic {
            RoutingLevel::FullyAutomatic
        } else if confidence >= t.notification {
            RoutingLevel::AutomaticWithNotification
        } else if confidence >= t.preview {
            RoutingLevel::AutomaticWithPreview
        } else {
            RoutingLevel::RequireApproval
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn model() -> ConfidenceModel {
        ConfidenceModel::new(ConfidenceWeights::default(), RoutingThresholds::default()).unwrap()
    }

    #[test]
    fn test_default_weights_sum_to_one() {
        assert!(ConfidenceWeights::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_weights_rejected() {
        let weights = ConfidenceWeights {
            history: 0.5,
            ..ConfidenceWeights::default()
        };
        assert!(matches!(
            ConfidenceModel::new(weights, RoutingThresholds::default()),
            Err(ConfigError::InvalidWeights(_))
        ));
    }

    #[test]
    fn test_thresholds_must_descend() {
        let thresholds = RoutingThresholds {
            fully_automatic: 0.7,
            notification: 0.8,
            preview: 0.65,
        };
        assert!(thresholds.validate().is_err());
    }

    #[test]
    fn test_score_is_clamped() {
        let m = model();
        let extreme = ConfidenceFactors {
            history: 7.0,
            validation: f64::INFINITY,
            coverage: 3.0,
            accuracy: 2.0,
            simplicity: 9.0,
        };
        assert!((m.score(&extreme) - 1.0).abs() < 1e-9);

        let negative = ConfidenceFactors {
            history: -4.0,
            validation: f64::NAN,
            coverage: -1.0,
            accuracy: f64::NEG_INFINITY,
            simplicity: -0.3,
        };
        assert_eq!(m.score(&negative), 0.0);
    }

    #[test]
    fn test_level_boundaries() {
        let m = model();
        assert_eq!(m.level(0.95), RoutingLevel::FullyAutomatic);
        assert_eq!(m.level(0.949), RoutingLevel::AutomaticWithNotification);
        assert_eq!(m.level(0.80), RoutingLevel::AutomaticWithNotification);
        assert_eq!(m.level(0.65), RoutingLevel::AutomaticWithPreview);
        assert_eq!(m.level(0.6499), RoutingLevel::RequireApproval);
    }

    #[test]
    fn test_factors_from_context() {
        let m = model();
        let history = DecisionHistory::new(10, 0.5);
        let context: InvocationOptions = [
            ("prerequisites_validated".to_string(), json!(true)),
            ("coverage".to_string(), json!(85)),
            ("complexity".to_string(), json!(0.2)),
        ]
        .into_iter()
        .collect();

        let f = m.factors(&history, "developer", "refactor", &context);
        assert_eq!(f.history, 0.5);
        assert_eq!(f.validation, 1.0);
        assert!((f.coverage - 0.85).abs() < 1e-9);
        assert!((f.simplicity - 0.8).abs() < 1e-9);
    }
}
