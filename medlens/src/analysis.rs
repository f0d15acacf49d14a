use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt::Write as _;

use crate::{
    error::{LensError, Result},
    language::Language,
};

/// Structured interpretation of one document in one output language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Localized document type shown to the user.
    #[serde(default)]
    pub classification: String,
    /// English snake_case document type, identical across output languages.
    #[serde(default)]
    pub document_type: String,
    pub summary: String,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub abnormal_highlights: Vec<String>,
    #[serde(default)]
    pub suggested_questions: Vec<String>,
    #[serde(default)]
    pub risk: RiskAssessment,
    #[serde(default)]
    pub action_plan: Option<ActionPlan>,
    #[serde(default)]
    pub glossary: Option<Vec<GlossaryTerm>>,
    #[serde(default)]
    pub report: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub name: String,
    #[serde(default, deserialize_with = "text_or_number")]
    pub value: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub reference_range: Option<String>,
    #[serde(default)]
    pub status: FindingStatus,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default)]
    pub plain_explanation: String,
    #[serde(default)]
    pub technical_explanation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingStatus {
    Normal,
    Low,
    High,
    Abnormal,
    Critical,
    #[default]
    Unknown,
}

impl FindingStatus {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "normal" | "ok" | "within range" | "in range" => Self::Normal,
            "low" | "below range" | "decreased" => Self::Low,
            "high" | "above range" | "elevated" | "increased" => Self::High,
            "abnormal" | "borderline" | "attention" => Self::Abnormal,
            "critical" | "severe" | "panic" => Self::Critical,
            _ => Self::Unknown,
        }
    }

    fn weight(self) -> f32 {
        match self {
            Self::Normal | Self::Unknown => 0.0,
            Self::Low | Self::High => 45.0,
            Self::Abnormal => 60.0,
            Self::Critical => 100.0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Low => "low",
            Self::High => "high",
            Self::Abnormal => "abnormal",
            Self::Critical => "critical",
            Self::Unknown => "unknown",
        }
    }
}

// Model output uses free-form casing and synonyms.
impl<'de> Deserialize<'de> for FindingStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let label = Option::<String>::deserialize(deserializer)?;
        Ok(label.map(|l| Self::from_label(&l)).unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Moderate,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    /// 0 to 100.
    pub score: u8,
}

impl RiskAssessment {
    pub fn from_findings(findings: &[Finding]) -> Self {
        if findings.is_empty() {
            return Self::default();
        }

        let total: f32 = findings
            .iter()
            .map(|f| f.status.weight() * clamp_confidence(f.confidence))
            .sum();
        let mut score = (total / findings.len() as f32).round();
        if findings.iter().any(|f| f.status == FindingStatus::Critical) {
            score = score.max(70.0);
        }
        let score = score.clamp(0.0, 100.0) as u8;

        let level = match score {
            0..20 => RiskLevel::Low,
            20..45 => RiskLevel::Moderate,
            45..70 => RiskLevel::High,
            _ => RiskLevel::Critical,
        };

        Self { level, score }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActionPlan {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlossaryTerm {
    pub term: String,
    #[serde(default)]
    pub definition: String,
}

fn default_confidence() -> f32 {
    0.5
}

fn clamp_confidence(confidence: f32) -> f32 {
    if confidence.is_nan() {
        return default_confidence();
    }
    // Some models answer in percent.
    let confidence = if confidence > 1.0 && confidence <= 100.0 {
        confidence / 100.0
    } else {
        confidence
    };
    confidence.clamp(0.0, 1.0)
}

fn text_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    })
}

impl AnalysisResult {
    /// Parses the analysis service's reply into a result with a locally computed risk.
    pub fn from_model_output(text: &str) -> Result<Self> {
        let json = strip_code_fence(text);
        let mut result: AnalysisResult = serde_json::from_str(json).map_err(|e| {
            LensError::AnalysisFailure(format!("analysis response is not valid JSON: {e}"))
        })?;

        if result.summary.trim().is_empty() {
            return Err(LensError::AnalysisFailure(
                "analysis response has no summary".to_string(),
            ));
        }

        result.normalize();
        Ok(result)
    }

    /// Clamps confidences, drops blank list items and recomputes the risk.
    pub fn normalize(&mut self) {
        self.classification = self.classification.trim().to_string();
        self.document_type = canonical_kind(&self.document_type);
        for finding in &mut self.findings {
            finding.confidence = clamp_confidence(finding.confidence);
        }
        self.findings.retain(|f| !f.name.trim().is_empty());
        self.abnormal_highlights.retain(|h| !h.trim().is_empty());
        self.suggested_questions.retain(|q| !q.trim().is_empty());
        if self.report.as_deref().is_some_and(|r| r.trim().is_empty()) {
            self.report = None;
        }
        self.risk = RiskAssessment::from_findings(&self.findings);
    }

    /// Key two results must share to be compared. Results saved without a
    /// `document_type` fall back to their classification.
    pub fn comparison_kind(&self) -> String {
        match canonical_kind(&self.document_type) {
            kind if kind.is_empty() => canonical_kind(&self.classification),
            kind => kind,
        }
    }

    pub fn export_report(&self, language: &Language) -> String {
        if let Some(report) = &self.report {
            return report.clone();
        }

        let mut out = String::new();
        let title = if self.classification.is_empty() {
            "Medical document"
        } else {
            &self.classification
        };
        let _ = writeln!(out, "# {title}");
        let _ = writeln!(out, "\n_Language: {}_\n", language.display_name());
        let _ = writeln!(out, "## Summary\n\n{}\n", self.summary.trim());

        let _ = writeln!(
            out,
            "## Overall risk\n\n{:?} ({}/100)\n",
            self.risk.level, self.risk.score
        );

        if !self.findings.is_empty() {
            let _ = writeln!(out, "## Findings\n");
            let _ = writeln!(out, "| Test | Value | Reference | Status |");
            let _ = writeln!(out, "|---|---|---|---|");
            for f in &self.findings {
                let value = match &f.unit {
                    Some(unit) => format!("{} {}", f.value, unit),
                    None => f.value.clone(),
                };
                let _ = writeln!(
                    out,
                    "| {} | {} | {} | {} |",
                    f.name,
                    value,
                    f.reference_range.as_deref().unwrap_or("-"),
                    f.status.label()
                );
            }
            out.push('\n');
        }

        if !self.abnormal_highlights.is_empty() {
            let _ = writeln!(out, "## Highlights\n");
            for h in &self.abnormal_highlights {
                let _ = writeln!(out, "- {h}");
            }
            out.push('\n');
        }

        if let Some(plan) = &self.action_plan {
            let _ = writeln!(out, "## Action plan\n");
            if !plan.summary.is_empty() {
                let _ = writeln!(out, "{}\n", plan.summary);
            }
            for (i, step) in plan.steps.iter().enumerate() {
                let _ = writeln!(out, "{}. {step}", i + 1);
            }
            out.push('\n');
        }

        if let Some(glossary) = self.glossary.as_deref().filter(|g| !g.is_empty()) {
            let _ = writeln!(out, "## Glossary\n");
            for t in glossary {
                let _ = writeln!(out, "- **{}**: {}", t.term, t.definition);
            }
        }

        out.trim_end().to_string()
    }
}

/// Lowercase words joined by `_`: "Complete Blood Count" becomes `complete_blood_count`.
pub fn canonical_kind(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for word in raw.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
        if !out.is_empty() {
            out.push('_');
        }
        out.extend(word.chars().flat_map(char::to_lowercase));
    }
    out
}

pub fn kinds_match(a: &str, b: &str) -> bool {
    let a = canonical_kind(a);
    !a.is_empty() && a == canonical_kind(b)
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Skip the info string ("json") on the opening fence line.
    let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}
