//! Conversation summaries produced by agents on request.
//!
//! Agents answer the summary request either with a JSON object or with
//! `- Key: value` lines. Keys are normalized to snake_case ASCII and a few
//! Spanish field names map to their English counterparts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field carrying the classification tag.
pub const TYPE_FIELD: &str = "type";

/// How an idle conversation should be followed up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SummaryKind {
    /// Nothing to report, conversation is over.
    NoReportDrop,
    /// Nothing to report yet, try to re-engage the user.
    NoReportFollow,
    /// Report to the secondary chat.
    ReportSecondary,
    /// Report to the primary chat.
    Report,
}

impl SummaryKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_uppercase().as_str() {
            "NO_REPORT_DROP" | "NO_REPORTAR_BAJA" => SummaryKind::NoReportDrop,
            "NO_REPORT_FOLLOW" | "NO_REPORTAR_SEGUIR" => SummaryKind::NoReportFollow,
            "REPORT_SECONDARY" | "SI_RESUMEN_G2" => SummaryKind::ReportSecondary,
            _ => SummaryKind::Report,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryKind::NoReportDrop => "NO_REPORT_DROP",
            SummaryKind::NoReportFollow => "NO_REPORT_FOLLOW",
            SummaryKind::ReportSecondary => "REPORT_SECONDARY",
            SummaryKind::Report => "REPORT",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryData {
    pub fields: BTreeMap<String, String>,
}

impl SummaryData {
    /// Parse an agent reply into a summary. Unparseable text yields an empty one.
    pub fn parse(text: &str) -> Self {
        if let Some(fields) = parse_json(text) {
            return Self { fields };
        }

        let mut fields = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim().trim_start_matches(['-', '*', '•']).trim();
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = normalize_key(key);
            if key.is_empty() {
                continue;
            }
            fields.insert(key, value.trim().to_string());
        }
        Self { fields }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(&normalize_key(key)).map(String::as_str)
    }

    /// Whether the field holds a real value, not a blank or an echoed label.
    pub fn has_field(&self, key: &str) -> bool {
        self.get(key).map_or(false, |v| !is_placeholder(v))
    }

    pub fn kind(&self) -> SummaryKind {
        self.get(TYPE_FIELD)
            .map(SummaryKind::from_tag)
            .unwrap_or(SummaryKind::Report)
    }

    /// Whether a yes/no field is affirmative.
    pub fn is_yes(&self, key: &str) -> bool {
        self.get(key).map_or(false, |v| {
            matches!(
                v.trim().to_lowercase().as_str(),
                "yes" | "si" | "sí" | "true"
            )
        })
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Render as `- Key: value` lines, classification tag omitted.
    pub fn to_report_text(&self) -> String {
        self.fields
            .iter()
            .filter(|(k, _)| k.as_str() != TYPE_FIELD)
            .map(|(k, v)| format!("- {}: {}", label(k), v))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn parse_json(text: &str) -> Option<BTreeMap<String, String>> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    let object: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(&text[start..=end]).ok()?;

    Some(
        object
            .into_iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                };
                (normalize_key(&k), value.trim().to_string())
            })
            .filter(|(k, _)| !k.is_empty())
            .collect(),
    )
}

fn normalize_key(key: &str) -> String {
    let mut out = String::new();
    for ch in key.trim().chars() {
        let ch = match ch {
            'á' | 'Á' => 'a',
            'é' | 'É' => 'e',
            'í' | 'Í' => 'i',
            'ó' | 'Ó' => 'o',
            'ú' | 'Ú' => 'u',
            'ñ' | 'Ñ' => 'n',
            c => c,
        };
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }
    let out = out.trim_end_matches('_').to_string();

    match out.as_str() {
        "nombre" => "name".to_string(),
        "tipo" => "type".to_string(),
        "telefono" => "phone".to_string(),
        "foto_o_video" => "photo_or_video".to_string(),
        _ => out,
    }
}

fn is_placeholder(value: &str) -> bool {
    let v = value.trim();
    if v.is_empty() {
        return true;
    }
    if matches!(
        v.to_lowercase().as_str(),
        "-" | "null" | "none" | "n/a" | "na" | "unknown" | "desconocido"
    ) {
        return true;
    }
    // "- Phone:" leaks from a template the agent did not fill
    v.starts_with('-') && v.ends_with(':')
}

fn label(key: &str) -> String {
    let spaced = key.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
