//! Agent identity, mode and configuration.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Unique agent identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Generate a fresh `agt_xxxxxxxxxxxx` identifier.
    pub fn generate() -> Self {
        let raw = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("agt_{}", &raw[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where an agent sends its mirrored orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    Inactive,
    Simulated,
    Live,
}

impl AgentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentMode::Inactive => "inactive",
            AgentMode::Simulated => "simulated",
            AgentMode::Live => "live",
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, AgentMode::Inactive)
    }
}

impl fmt::Display for AgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "inactive" => Ok(AgentMode::Inactive),
            // "paper" and "production" are the names older records used
            "simulated" | "paper" => Ok(AgentMode::Simulated),
            "live" | "production" => Ok(AgentMode::Live),
            other => Err(format!("unknown agent mode '{}'", other)),
        }
    }
}

/// Behavior an agent runs. New behaviors are new variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentKind {
    /// Mirror the trades of the participant behind `target_profile`.
    Copy { target_profile: String },
}

impl AgentKind {
    pub fn name(&self) -> &'static str {
        match self {
            AgentKind::Copy { .. } => "copy",
        }
    }

    pub fn target_profile(&self) -> &str {
        match self {
            AgentKind::Copy { target_profile } => target_profile,
        }
    }
}

/// Resolve a participant wallet address from a profile reference.
///
/// Accepts a bare `0x…` address or a profile URL such as
/// `https://polymarket.com/profile/0xabc…` or `…/user/0xabc…`.
pub fn resolve_participant(profile: &str) -> Result<String, String> {
    let profile = profile.trim();
    let candidate = profile
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(profile);
    let candidate = candidate
        .split(['?', '#'])
        .next()
        .unwrap_or(candidate)
        .trim_start_matches('@');

    let hex = candidate
        .strip_prefix("0x")
        .or_else(|| candidate.strip_prefix("0X"))
        .ok_or_else(|| format!("no wallet address in profile '{}'", profile))?;

    if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("invalid wallet address in profile '{}'", profile));
    }

    Ok(format!("0x{}", hex.to_lowercase()))
}

/// Sizing and risk parameters of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Fraction of the source trade's notional to mirror
    pub copy_ratio: Decimal,

    /// Smallest mirrored trade in USDC; smaller intents are rejected
    pub min_trade_value: Decimal,

    /// Largest mirrored trade in USDC; larger intents are clamped
    pub max_trade_value: Decimal,

    /// Adverse move (percent of entry) that forces a close; 0 disables
    pub stop_loss_percentage: Decimal,

    /// Trailing 24h realized loss that blocks new opens; 0 disables
    pub max_daily_loss: Decimal,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            copy_ratio: dec!(0.5),           // Mirror half the source size
            min_trade_value: dec!(50),       // Min $50
            max_trade_value: dec!(500),      // Max $500
            stop_loss_percentage: dec!(10),  // Close at -10%
            max_daily_loss: dec!(1000),      // Stop opening after $1000 lost in 24h
        }
    }
}

impl RiskLimits {
    pub fn validate(&self) -> Result<(), String> {
        if self.copy_ratio <= Decimal::ZERO {
            return Err("copy ratio must be positive".to_string());
        }
        if self.min_trade_value < Decimal::ZERO {
            return Err("minimum trade value cannot be negative".to_string());
        }
        if self.max_trade_value < self.min_trade_value {
            return Err(format!(
                "maximum trade value {} is below the minimum {}",
                self.max_trade_value, self.min_trade_value
            ));
        }
        if self.stop_loss_percentage < Decimal::ZERO {
            return Err("stop loss percentage cannot be negative".to_string());
        }
        if self.max_daily_loss < Decimal::ZERO {
            return Err("max daily loss cannot be negative".to_string());
        }
        Ok(())
    }
}

/// Persisted configuration of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: AgentId,
    pub name: String,
    pub kind: AgentKind,
    pub mode: AgentMode,
    pub limits: RiskLimits,
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentConfig {
    /// New inactive copy agent with default limits.
    pub fn copy(name: impl Into<String>, target_profile: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: AgentId::generate(),
            name: name.into(),
            kind: AgentKind::Copy {
                target_profile: target_profile.into(),
            },
            mode: AgentMode::Inactive,
            limits: RiskLimits::default(),
            notes: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_limits(mut self, limits: RiskLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("agent name cannot be empty".to_string());
        }
        if self.kind.target_profile().trim().is_empty() {
            return Err("target profile cannot be empty".to_string());
        }
        self.limits.validate()
    }

    /// Wallet address of the participant this agent mirrors.
    pub fn target_participant(&self) -> Result<String, String> {
        resolve_participant(self.kind.target_profile())
    }
}

/// Partial configuration change; `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct AgentUpdate {
    pub name: Option<String>,
    pub target_profile: Option<String>,
    pub mode: Option<AgentMode>,
    pub copy_ratio: Option<Decimal>,
    pub min_trade_value: Option<Decimal>,
    pub max_trade_value: Option<Decimal>,
    pub stop_loss_percentage: Option<Decimal>,
    pub max_daily_loss: Option<Decimal>,
    pub notes: Option<String>,
}

impl AgentUpdate {
    pub fn mode(mode: AgentMode) -> Self {
        Self {
            mode: Some(mode),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.target_profile.is_none()
            && self.mode.is_none()
            && self.copy_ratio.is_none()
            && self.min_trade_value.is_none()
            && self.max_trade_value.is_none()
            && self.stop_loss_percentage.is_none()
            && self.max_daily_loss.is_none()
            && self.notes.is_none()
    }

    /// Apply onto `config`, returning the updated copy.
    pub fn apply(&self, config: &AgentConfig) -> AgentConfig {
        let mut next = config.clone();
        if let Some(name) = &self.name {
            next.name = name.clone();
        }
        if let Some(profile) = &self.target_profile {
            next.kind = match &next.kind {
                AgentKind::Copy { .. } => AgentKind::Copy {
                    target_profile: profile.clone(),
                },
            };
        }
        if let Some(mode) = self.mode {
            next.mode = mode;
        }
        if let Some(v) = self.copy_ratio {
            next.limits.copy_ratio = v;
        }
        if let Some(v) = self.min_trade_value {
            next.limits.min_trade_value = v;
        }
        if let Some(v) = self.max_trade_value {
            next.limits.max_trade_value = v;
        }
        if let Some(v) = self.stop_loss_percentage {
            next.limits.stop_loss_percentage = v;
        }
        if let Some(v) = self.max_daily_loss {
            next.limits.max_daily_loss = v;
        }
        if let Some(notes) = &self.notes {
            next.notes = notes.clone();
        }
        next.updated_at = Utc::now();
        next
    }
}

/// Filter for listing agents.
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub mode: Option<AgentMode>,
    pub name_contains: Option<String>,
}

impl AgentFilter {
    pub fn matches(&self, config: &AgentConfig) -> bool {
        if let Some(mode) = self.mode {
            if config.mode != mode {
                return false;
            }
        }
        if let Some(needle) = &self.name_contains {
            if !config.name.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

/// Starting bankroll of a fresh simulated wallet, in USDC.
pub const DEFAULT_PAPER_BALANCE: Decimal = dec!(1000);

/// Simulated bankroll of one agent.
///
/// Simulated opens debit their amount, closes credit the sale proceeds and
/// cancellations refund the original amount.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaperWallet {
    pub agent_id: AgentId,
    pub initial: Decimal,
    pub balance: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl PaperWallet {
    /// Wallet of an agent that never traded.
    pub fn fresh(agent_id: AgentId, now: DateTime<Utc>) -> Self {
        Self {
            agent_id,
            initial: DEFAULT_PAPER_BALANCE,
            balance: DEFAULT_PAPER_BALANCE,
            updated_at: now,
        }
    }

    /// Balance change since the last reset.
    pub fn change(&self) -> Decimal {
        self.balance - self.initial
    }
}
