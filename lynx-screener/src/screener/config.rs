//! Screening criteria and strategy presets.
//!
//! A request names a preset and may override any of its bounds. The
//! resolved [`ScreeningCriteria`] is validated once and then frozen for the
//! lifetime of the task.

use serde::{Deserialize, Serialize};

use super::ScreeningError;
use crate::data::{format_amount, format_volume, InstrumentMeta, Quote};

// ============================================================================
// Strategy Presets
// ============================================================================

/// Built-in strategy presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyPreset {
    /// 稳健型
    Conservative,
    /// 平衡型
    #[default]
    Balanced,
    /// 成长型
    Growth,
}

impl StrategyPreset {
    pub const ALL: [StrategyPreset; 3] = [Self::Conservative, Self::Balanced, Self::Growth];

    /// Parse the English key or the Chinese display name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "conservative" | "稳健型" => Some(Self::Conservative),
            "balanced" | "平衡型" => Some(Self::Balanced),
            "growth" | "成长型" => Some(Self::Growth),
            _ => None,
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            Self::Conservative => "conservative",
            Self::Balanced => "balanced",
            Self::Growth => "growth",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Conservative => "稳健型",
            Self::Balanced => "平衡型",
            Self::Growth => "成长型",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Conservative => "适合熊市或保守投资",
            Self::Balanced => "适合震荡市，均衡配置",
            Self::Growth => "适合牛市或激进投资",
        }
    }

    pub fn note(&self) -> &'static str {
        match self {
            Self::Conservative => "严格筛选，追求防守",
            Self::Balanced => "适中筛选，风险收益平衡",
            Self::Growth => "宽松筛选，追求进攻",
        }
    }

    /// Default bounds of the preset.
    pub fn bounds(&self) -> PresetBounds {
        match self {
            Self::Conservative => PresetBounds {
                pe_min: 15.0,
                pe_max: 30.0,
                pb_min: 1.0,
                pb_max: 3.0,
                market_cap_min: 50.0,
            },
            Self::Balanced => PresetBounds {
                pe_min: 10.0,
                pe_max: 40.0,
                pb_min: 0.8,
                pb_max: 5.0,
                market_cap_min: 50.0,
            },
            Self::Growth => PresetBounds {
                pe_min: 0.0,
                pe_max: 50.0,
                pb_min: 0.0,
                pb_max: 10.0,
                market_cap_min: 30.0,
            },
        }
    }
}

/// Numeric bounds carried by a preset. Market cap in 100M CNY.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PresetBounds {
    pub pe_min: f64,
    pub pe_max: f64,
    pub pb_min: f64,
    pub pb_max: f64,
    pub market_cap_min: f64,
}

// ============================================================================
// Request & Criteria
// ============================================================================

/// Price-change direction filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeDirection {
    #[default]
    Any,
    Up,
    Down,
}

impl ChangeDirection {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "all" | "any" => Some(Self::Any),
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            _ => None,
        }
    }
}

/// Screening request as submitted by a caller. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScreeningRequest {
    pub strategy: Option<String>,
    pub industry: Option<String>,
    #[serde(alias = "peMin")]
    pub pe_min: Option<f64>,
    #[serde(alias = "peMax")]
    pub pe_max: Option<f64>,
    #[serde(alias = "pbMin")]
    pub pb_min: Option<f64>,
    #[serde(alias = "pbMax")]
    pub pb_max: Option<f64>,
    #[serde(alias = "marketCapMin")]
    pub market_cap_min: Option<f64>,
    #[serde(alias = "changeType", alias = "change_direction")]
    pub change_type: Option<String>,
}

/// Resolved, validated filter for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreeningCriteria {
    pub strategy: StrategyPreset,
    pub pe_min: Option<f64>,
    pub pe_max: Option<f64>,
    pub pb_min: Option<f64>,
    pub pb_max: Option<f64>,
    /// In 100M CNY
    pub market_cap_min: Option<f64>,
    pub change_direction: ChangeDirection,
    /// `None` matches every industry
    pub industry: Option<String>,
}

impl Default for ScreeningCriteria {
    fn default() -> Self {
        Self::from_preset(StrategyPreset::default())
    }
}

impl ScreeningCriteria {
    pub fn from_preset(preset: StrategyPreset) -> Self {
        let bounds = preset.bounds();
        Self {
            strategy: preset,
            pe_min: Some(bounds.pe_min),
            pe_max: Some(bounds.pe_max),
            pb_min: Some(bounds.pb_min),
            pb_max: Some(bounds.pb_max),
            market_cap_min: Some(bounds.market_cap_min),
            change_direction: ChangeDirection::Any,
            industry: None,
        }
    }

    /// Apply a request on top of its preset and validate the result.
    ///
    /// An unknown preset name falls back to the balanced preset.
    pub fn from_request(req: &ScreeningRequest) -> Result<Self, ScreeningError> {
        let preset = req
            .strategy
            .as_deref()
            .and_then(StrategyPreset::parse)
            .unwrap_or_default();
        let mut criteria = Self::from_preset(preset);

        if let Some(v) = req.pe_min {
            criteria.pe_min = Some(v);
        }
        if let Some(v) = req.pe_max {
            criteria.pe_max = Some(v);
        }
        if let Some(v) = req.pb_min {
            criteria.pb_min = Some(v);
        }
        if let Some(v) = req.pb_max {
            criteria.pb_max = Some(v);
        }
        if let Some(v) = req.market_cap_min {
            criteria.market_cap_min = Some(v);
        }
        if let Some(direction) = &req.change_type {
            criteria.change_direction = ChangeDirection::parse(direction).ok_or_else(|| {
                ScreeningError::Validation(format!("unknown change direction {direction:?}"))
            })?;
        }
        criteria.industry = req
            .industry
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty() && *s != "全部" && !s.eq_ignore_ascii_case("all"))
            .map(str::to_string);

        criteria.validate()?;
        Ok(criteria)
    }

    pub fn validate(&self) -> Result<(), ScreeningError> {
        let bounds = [
            ("pe_min", self.pe_min),
            ("pe_max", self.pe_max),
            ("pb_min", self.pb_min),
            ("pb_max", self.pb_max),
            ("market_cap_min", self.market_cap_min),
        ];
        for (name, value) in bounds {
            let Some(v) = value else { continue };
            if !v.is_finite() {
                return Err(ScreeningError::Validation(format!("{name} must be a finite number")));
            }
            if v < 0.0 {
                return Err(ScreeningError::Validation(format!("{name} must not be negative")));
            }
        }
        if let (Some(lo), Some(hi)) = (self.pe_min, self.pe_max) {
            if lo > hi {
                return Err(ScreeningError::Validation(format!("pe_min {lo} exceeds pe_max {hi}")));
            }
        }
        if let (Some(lo), Some(hi)) = (self.pb_min, self.pb_max) {
            if lo > hi {
                return Err(ScreeningError::Validation(format!("pb_min {lo} exceeds pb_max {hi}")));
            }
        }
        Ok(())
    }

    /// Whether a fetched instrument passes every filter.
    ///
    /// PE, PB and market cap bounds only apply when the figure is known
    /// and positive.
    pub fn matches(&self, candidate: &Candidate) -> bool {
        if let Some(pe) = candidate.pe.filter(|v| *v > 0.0) {
            if self.pe_min.is_some_and(|lo| pe < lo) || self.pe_max.is_some_and(|hi| pe > hi) {
                return false;
            }
        }

        if let Some(pb) = candidate.quote.pb.filter(|v| *v > 0.0) {
            if self.pb_min.is_some_and(|lo| pb < lo) || self.pb_max.is_some_and(|hi| pb > hi) {
                return false;
            }
        }

        if let (Some(cap), Some(min)) = (
            candidate.quote.market_cap.filter(|v| *v > 0.0),
            self.market_cap_min,
        ) {
            if cap / 1e8 < min {
                return false;
            }
        }

        let change = candidate.quote.change_pct;
        match self.change_direction {
            ChangeDirection::Up if change <= 0.0 => return false,
            ChangeDirection::Down if change >= 0.0 => return false,
            _ => {}
        }

        if let Some(industry) = &self.industry {
            if candidate.meta.industry.as_deref() != Some(industry.as_str()) {
                return false;
            }
        }

        true
    }
}

// ============================================================================
// Candidates & Results
// ============================================================================

/// One instrument after its quote was fetched.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub meta: InstrumentMeta,
    pub quote: Quote,
    pub pe: Option<f64>,
}

/// Ranked output row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreeningResult {
    /// 1-based position after sorting
    pub rank: usize,
    pub code: String,
    pub name: String,
    pub industry: Option<String>,
    pub price: f64,
    pub change_pct: f64,
    /// Human readable volume ("3.50万手")
    pub volume: String,
    pub pe: Option<f64>,
    pub pb: Option<f64>,
    /// Human readable market value ("2100.00亿"), "未知" when absent
    pub market_cap: String,
}

impl ScreeningResult {
    pub fn from_candidate(rank: usize, c: &Candidate) -> Self {
        Self {
            rank,
            code: c.meta.code.clone(),
            name: if c.meta.name.is_empty() {
                c.quote.name.clone()
            } else {
                c.meta.name.clone()
            },
            industry: c.meta.industry.clone(),
            price: c.quote.price,
            change_pct: c.quote.change_pct,
            volume: format_volume(c.quote.volume),
            pe: c.pe,
            pb: c.quote.pb,
            market_cap: c
                .quote
                .market_cap
                .map(format_amount)
                .unwrap_or_else(|| "未知".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::FreshnessTier;
    use chrono::{NaiveDate, Utc};
    use test_case::test_case;

    fn candidate(industry: Option<&str>, change: f64, pe: Option<f64>) -> Candidate {
        let mut meta = InstrumentMeta::new("600519", "贵州茅台");
        meta.industry = industry.map(str::to_string);
        Candidate {
            meta,
            quote: Quote {
                code: "600519".into(),
                name: "贵州茅台".into(),
                price: 1700.0,
                change_pct: change,
                open: None,
                high: None,
                low: None,
                volume: 35_000.0,
                turnover: 0.0,
                pe: None,
                pb: None,
                market_cap: None,
                trade_date: NaiveDate::from_ymd_opt(2024, 5, 10).unwrap(),
                fetched_at: Utc::now(),
                freshness: FreshnessTier::Live,
                delay: String::new(),
            },
            pe,
        }
    }

    #[test_case("稳健型", StrategyPreset::Conservative ; "chinese conservative")]
    #[test_case("growth", StrategyPreset::Growth ; "english growth")]
    #[test_case("平衡型", StrategyPreset::Balanced ; "chinese balanced")]
    fn test_preset_parse(name: &str, expected: StrategyPreset) {
        assert_eq!(StrategyPreset::parse(name), Some(expected));
    }

    #[test]
    fn test_unknown_preset_falls_back_to_balanced() {
        let req = ScreeningRequest {
            strategy: Some("激进型".into()),
            ..Default::default()
        };
        let criteria = ScreeningCriteria::from_request(&req).unwrap();
        assert_eq!(criteria.strategy, StrategyPreset::Balanced);
        assert_eq!(criteria.pe_min, Some(10.0));
        assert_eq!(criteria.pe_max, Some(40.0));
    }

    #[test]
    fn test_request_overrides_preset() {
        let req: ScreeningRequest = serde_json::from_value(serde_json::json!({
            "strategy": "稳健型",
            "peMax": 20,
            "changeType": "up",
            "industry": "全部"
        }))
        .unwrap();
        let criteria = ScreeningCriteria::from_request(&req).unwrap();
        assert_eq!(criteria.strategy, StrategyPreset::Conservative);
        assert_eq!(criteria.pe_min, Some(15.0));
        assert_eq!(criteria.pe_max, Some(20.0));
        assert_eq!(criteria.change_direction, ChangeDirection::Up);
        assert_eq!(criteria.industry, None);
    }

    #[test_case(serde_json::json!({"pe_min": 30, "pe_max": 10}) ; "inverted pe range")]
    #[test_case(serde_json::json!({"pbMin": 4, "pbMax": 1}) ; "inverted pb range")]
    #[test_case(serde_json::json!({"marketCapMin": -1}) ; "negative bound")]
    #[test_case(serde_json::json!({"changeType": "sideways"}) ; "unknown direction")]
    fn test_validation_rejects(body: serde_json::Value) {
        let req: ScreeningRequest = serde_json::from_value(body).unwrap();
        assert!(matches!(
            ScreeningCriteria::from_request(&req),
            Err(ScreeningError::Validation(_))
        ));
    }

    #[test]
    fn test_non_finite_bound_rejected() {
        let mut criteria = ScreeningCriteria::default();
        criteria.pb_max = Some(f64::INFINITY);
        assert!(criteria.validate().is_err());
    }

    #[test]
    fn test_pe_filter_skipped_when_unknown_or_non_positive() {
        let criteria = ScreeningCriteria::from_preset(StrategyPreset::Conservative);
        assert!(criteria.matches(&candidate(None, 1.0, None)));
        assert!(criteria.matches(&candidate(None, 1.0, Some(-3.0))));
        assert!(criteria.matches(&candidate(None, 1.0, Some(20.0))));
        assert!(!criteria.matches(&candidate(None, 1.0, Some(45.0))));
    }

    #[test]
    fn test_direction_and_industry() {
        let mut criteria = ScreeningCriteria::default();
        criteria.change_direction = ChangeDirection::Up;
        assert!(!criteria.matches(&candidate(None, 0.0, None)));
        assert!(criteria.matches(&candidate(None, 0.1, None)));

        criteria.change_direction = ChangeDirection::Down;
        assert!(!criteria.matches(&candidate(None, 0.0, None)));
        assert!(criteria.matches(&candidate(None, -0.1, None)));

        criteria.change_direction = ChangeDirection::Any;
        criteria.industry = Some("酿酒行业".into());
        assert!(criteria.matches(&candidate(Some("酿酒行业"), 0.0, None)));
        assert!(!criteria.matches(&candidate(Some("银行"), 0.0, None)));
        assert!(!criteria.matches(&candidate(None, 0.0, None)));
    }

    #[test]
    fn test_market_cap_filter_in_hundred_millions() {
        let criteria = ScreeningCriteria::from_preset(StrategyPreset::Growth);
        let mut small = candidate(None, 1.0, None);
        small.quote.market_cap = Some(20e8);
        assert!(!criteria.matches(&small));

        let mut big = candidate(None, 1.0, None);
        big.quote.market_cap = Some(40e8);
        assert!(criteria.matches(&big));
    }

    #[test]
    fn test_result_formatting() {
        let c = candidate(Some("酿酒行业"), 1.2, Some(28.5));
        let result = ScreeningResult::from_candidate(1, &c);
        assert_eq!(result.volume, "3.50万手");
        assert_eq!(result.market_cap, "未知");
        assert_eq!(result.industry.as_deref(), Some("酿酒行业"));
    }
}
