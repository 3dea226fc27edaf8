use serde::{Deserialize, Serialize};

use querypilot_common::{Error, Result};

use crate::oracle::sanitize_json_reply;

/// Ordered steps describing how to answer one user turn. The tool set is
/// a closed variant: unknown tags fail parsing instead of falling through
/// to a registry lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

// Unknown tool tags fail the parse; unknown extra fields are discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "tool")]
pub enum PlanStep {
    #[serde(rename = "dbQuery", rename_all = "camelCase")]
    DbQuery { sub_query: String },

    #[serde(rename = "computeStats", rename_all = "camelCase")]
    ComputeStats { on_step: usize, ops: Vec<StatOp> },

    #[serde(rename = "secondaryAnalysis", rename_all = "camelCase")]
    SecondaryAnalysis {
        on_steps: Vec<usize>,
        instructions: String,
    },
}

impl PlanStep {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DbQuery { .. } => "dbQuery",
            Self::ComputeStats { .. } => "computeStats",
            Self::SecondaryAnalysis { .. } => "secondaryAnalysis",
        }
    }
}

/// In-process statistics over a prior step's rows. Wire form is the
/// compact colon syntax: `count`, `topK:city:5`, `mean:price`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StatOp {
    Count,
    TopK { field: String, k: usize },
    Mean { field: String },
    Min { field: String },
    Max { field: String },
    Sum { field: String },
    Distinct { field: String },
}

impl StatOp {
    pub fn label(&self) -> String {
        String::from(self.clone())
    }
}

impl TryFrom<String> for StatOp {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        let mut parts = value.split(':');
        let op = parts.next().unwrap_or_default();
        let field = parts.next();
        let extra = parts.next();

        match (op, field, extra) {
            ("count", None, None) => Ok(Self::Count),
            ("topK", Some(field), Some(k)) => {
                let k: usize = k
                    .parse()
                    .map_err(|_| format!("invalid topK count in '{value}'"))?;
                Ok(Self::TopK {
                    field: field.to_string(),
                    k: k.max(1),
                })
            }
            ("mean", Some(field), None) => Ok(Self::Mean {
                field: field.to_string(),
            }),
            ("min", Some(field), None) => Ok(Self::Min {
                field: field.to_string(),
            }),
            ("max", Some(field), None) => Ok(Self::Max {
                field: field.to_string(),
            }),
            ("sum", Some(field), None) => Ok(Self::Sum {
                field: field.to_string(),
            }),
            ("distinct", Some(field), None) => Ok(Self::Distinct {
                field: field.to_string(),
            }),
            _ => Err(format!("unknown stat op '{value}'")),
        }
    }
}

impl From<StatOp> for String {
    fn from(op: StatOp) -> Self {
        match op {
            StatOp::Count => "count".to_string(),
            StatOp::TopK { field, k } => format!("topK:{field}:{k}"),
            StatOp::Mean { field } => format!("mean:{field}"),
            StatOp::Min { field } => format!("min:{field}"),
            StatOp::Max { field } => format!("max:{field}"),
            StatOp::Sum { field } => format!("sum:{field}"),
            StatOp::Distinct { field } => format!("distinct:{field}"),
        }
    }
}

/// Parse an oracle reply into a typed plan. Accepts either a bare step
/// array or an object with a `steps` field; everything else is
/// `PlanParseFailed`.
pub fn parse_plan(raw: &str) -> Result<Plan> {
    let sanitized = sanitize_json_reply(raw);
    let value: serde_json::Value = serde_json::from_str(&sanitized)
        .map_err(|e| Error::PlanParseFailed(format!("not JSON: {e}")))?;

    let steps_value = if value.is_array() {
        value
    } else if let Some(steps) = value.get("steps") {
        steps.clone()
    } else {
        return Err(Error::PlanParseFailed(
            "expected a step array or {steps: [...]}".to_string(),
        ));
    };

    let steps: Vec<PlanStep> = serde_json::from_value(steps_value)
        .map_err(|e| Error::PlanParseFailed(format!("invalid step: {e}")))?;

    Ok(Plan { steps })
}

#[cfg(test)]
mod tests {
    use super::{parse_plan, PlanStep, StatOp};

    #[test]
    fn a_bare_step_array_parses() {
        let plan = parse_plan(r#"[{"tool": "dbQuery", "subQuery": "latest orders"}]"#)
            .expect("plan should parse");
        assert_eq!(plan.steps.len(), 1);
        assert!(matches!(plan.steps[0], PlanStep::DbQuery { .. }));
    }

    #[test]
    fn a_steps_object_parses() {
        let plan = parse_plan(
            r#"{"steps": [
                {"tool": "dbQuery", "subQuery": "orders this month"},
                {"tool": "computeStats", "onStep": 0, "ops": ["count", "sum:total"]},
                {"tool": "secondaryAnalysis", "onSteps": [0, 1], "instructions": "explain the trend"}
            ]}"#,
        )
        .expect("plan should parse");
        assert_eq!(plan.steps.len(), 3);
        match &plan.steps[1] {
            PlanStep::ComputeStats { on_step, ops } => {
                assert_eq!(*on_step, 0);
                assert_eq!(ops[0], StatOp::Count);
                assert_eq!(
                    ops[1],
                    StatOp::Sum {
                        field: "total".to_string()
                    }
                );
            }
            other => panic!("expected computeStats, got {other:?}"),
        }
    }

    #[test]
    fn unknown_tools_are_rejected_at_parse_time() {
        let err = parse_plan(r#"[{"tool": "shellExec", "command": "rm -rf /"}]"#)
            .expect_err("unknown tool must fail");
        assert_eq!(err.kind(), "PlanParseFailed");
    }

    #[test]
    fn missing_required_fields_fail_parsing() {
        let err = parse_plan(r#"[{"tool": "dbQuery"}]"#).expect_err("missing field must fail");
        assert_eq!(err.kind(), "PlanParseFailed");
    }

    #[test]
    fn fenced_output_still_parses() {
        let raw = "```json\n[{\"tool\": \"dbQuery\", \"subQuery\": \"count users\"}]\n```";
        let plan = parse_plan(raw).expect("fenced plan should parse");
        assert_eq!(plan.steps.len(), 1);
    }

    #[test]
    fn stat_ops_round_trip_their_colon_syntax() {
        for raw in ["count", "topK:city:5", "mean:price", "distinct:status"] {
            let op = StatOp::try_from(raw.to_string()).expect("op should parse");
            assert_eq!(op.label(), raw);
        }
        assert!(StatOp::try_from("median:price".to_string()).is_err());
    }
}
