//! Typed run policies parsed from configuration strings
//!
//! Mode strings are parsed once, at load time. Everything downstream matches
//! on these enums.

use crate::distill::CoefficientPolicy;
use crate::error::{Error, Result};
use crate::features::LayerScope;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

fn scope_name(scope: LayerScope) -> &'static str {
    match scope {
        LayerScope::All => "all",
        LayerScope::Conv => "conv",
        LayerScope::Fc => "fc",
    }
}

/// Distillation settings encoded by `(all|conv|fc)(-attn)?(-grad)?-dist`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistillPolicy {
    /// Layers taking part
    pub scope: LayerScope,
    /// Weight terms by student/teacher discrepancy
    pub attention: bool,
    /// Grow the set of active terms over training
    pub gradual: bool,
}

impl DistillPolicy {
    /// GAD coefficient policy for these flags
    pub fn coefficient_policy(&self) -> CoefficientPolicy {
        CoefficientPolicy::from_flags(self.attention, self.gradual)
    }
}

/// Distillation on or off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DistillMode {
    /// Plain supervised training
    #[default]
    Disabled,
    /// Distill with the given policy
    Enabled(DistillPolicy),
}

impl DistillMode {
    /// The policy, when distillation is on
    pub fn policy(&self) -> Option<DistillPolicy> {
        match self {
            DistillMode::Disabled => None,
            DistillMode::Enabled(policy) => Some(*policy),
        }
    }

    /// Whether distillation is on
    pub fn is_enabled(&self) -> bool {
        matches!(self, DistillMode::Enabled(_))
    }
}

impl FromStr for DistillMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "None" {
            return Ok(DistillMode::Disabled);
        }
        let invalid = || {
            Error::ConfigError(format!(
                "invalid distillation mode '{}' (expected (all|conv|fc)(-attn)?(-grad)?-dist or None)",
                s
            ))
        };

        let body = s.strip_suffix("-dist").ok_or_else(invalid)?;
        let mut parts = body.split('-');
        let scope = parts
            .next()
            .and_then(|p| p.parse::<LayerScope>().ok())
            .ok_or_else(invalid)?;

        let mut rest: Vec<&str> = parts.collect();
        let gradual = rest.last() == Some(&"grad");
        if gradual {
            rest.pop();
        }
        let attention = rest.last() == Some(&"attn");
        if attention {
            rest.pop();
        }
        if !rest.is_empty() {
            return Err(invalid());
        }

        Ok(DistillMode::Enabled(DistillPolicy {
            scope,
            attention,
            gradual,
        }))
    }
}

impl fmt::Display for DistillMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistillMode::Disabled => write!(f, "None"),
            DistillMode::Enabled(p) => {
                write!(f, "{}", scope_name(p.scope))?;
                if p.attention {
                    write!(f, "-attn")?;
                }
                if p.gradual {
                    write!(f, "-grad")?;
                }
                write!(f, "-dist")
            }
        }
    }
}

impl TryFrom<String> for DistillMode {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<DistillMode> for String {
    fn from(mode: DistillMode) -> Self {
        mode.to_string()
    }
}

/// How the external pruner's masks are treated
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PruneMode {
    /// No pruning
    #[default]
    Disabled,
    /// Pruned weights stay zero: their gradients are masked every step
    Hard(String),
    /// Pruned weights may regrow; the pruner runs again after training
    Soft(String),
}

impl PruneMode {
    /// Whether pruning runs at all
    pub fn is_enabled(&self) -> bool {
        !matches!(self, PruneMode::Disabled)
    }

    /// Whether gradient masks are enforced
    pub fn is_hard(&self) -> bool {
        matches!(self, PruneMode::Hard(_))
    }

    /// Whether the mode is soft
    pub fn is_soft(&self) -> bool {
        matches!(self, PruneMode::Soft(_))
    }

    /// Pruner-specific method name, passed through unchanged
    pub fn method(&self) -> Option<&str> {
        match self {
            PruneMode::Disabled => None,
            PruneMode::Hard(m) | PruneMode::Soft(m) => Some(m),
        }
    }
}

impl FromStr for PruneMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "None" => Ok(PruneMode::Disabled),
            "" => Err(Error::ConfigError("empty prune mode".to_string())),
            m if m.contains("soft") => Ok(PruneMode::Soft(m.to_string())),
            m => Ok(PruneMode::Hard(m.to_string())),
        }
    }
}

impl fmt::Display for PruneMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.method() {
            None => write!(f, "None"),
            Some(m) => write!(f, "{}", m),
        }
    }
}

impl TryFrom<String> for PruneMode {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<PruneMode> for String {
    fn from(mode: PruneMode) -> Self {
        mode.to_string()
    }
}

/// Layers quantized by `(all|conv|fc)-quan`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QuantScope(pub LayerScope);

impl QuantScope {
    /// Whether a weight tensor of this rank is quantized
    pub fn admits(&self, ndim: usize) -> bool {
        match (self.0, ndim) {
            (LayerScope::All, 2 | 4) => true,
            (LayerScope::Conv, 4) => true,
            (LayerScope::Fc, 2) => true,
            _ => false,
        }
    }
}

impl Default for QuantScope {
    fn default() -> Self {
        QuantScope(LayerScope::All)
    }
}

impl FromStr for QuantScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.strip_suffix("-quan")
            .and_then(|scope| scope.parse::<LayerScope>().ok())
            .map(QuantScope)
            .ok_or_else(|| {
                Error::ConfigError(format!(
                    "invalid quantization mode '{}' (expected all-quan, conv-quan or fc-quan)",
                    s
                ))
            })
    }
}

impl fmt::Display for QuantScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-quan", scope_name(self.0))
    }
}

impl TryFrom<String> for QuantScope {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<QuantScope> for String {
    fn from(scope: QuantScope) -> Self {
        scope.to_string()
    }
}
