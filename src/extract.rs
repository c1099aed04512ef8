use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ai::CompletionProvider;
use crate::models::{unspecified, Activity, Benefit, CanonicalJobRecord, Principal, Requirement};

const PROMPT_TEMPLATE: &str = r#"Analyze the following job description and extract its information into a single JSON object with exactly these four keys:

"tabla_principal": an object with the keys "nombre_puesto", "empresa", "lugar", "tipo_contrato", "link_publicacion", "fecha_publicacion", "nivel_puesto", "industria", "fuente_publicacion", "salario_estimado", "fecha_cierre".
"tabla_requerimientos": a list of objects with the keys "tipo_requerimiento" (for example: Experiencia, Soft skills, Cloud Computing, Big Data y Procesamiento, Bases de Datos y Almacenamiento, ETL/ELT y Automatización, Programación y Scripts, Visualización y BI, DevOps y Control de Versiones, Machine Learning e Inteligencia Artificial), "tecnologia" and "nivel_o_anos".
"tabla_beneficios": a list of objects with the key "beneficio".
"tabla_actividades": a list of objects with the key "actividad".

If a field is not stated in the description, write "No se especifica".
Answer with the JSON object only, no explanations and no Markdown.

Description:
{description}"#;

pub fn build_prompt(description: &str) -> String {
    PROMPT_TEMPLATE.replace("{description}", description.trim())
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("job has no description to analyze")]
    EmptyDescription,

    #[error("completion request failed: {0}")]
    Provider(String),

    #[error("response contains no JSON object")]
    NoJson { raw: String },

    #[error("response is not valid JSON: {source}")]
    Malformed {
        raw: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("response does not match the job schema: {source}")]
    Schema {
        raw: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("extraction cancelled")]
    Cancelled,
}

impl ExtractError {
    /// The model output that failed to parse, kept for diagnosis.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            ExtractError::NoJson { raw }
            | ExtractError::Malformed { raw, .. }
            | ExtractError::Schema { raw, .. } => Some(raw),
            _ => None,
        }
    }
}

pub struct Extractor {
    provider: Arc<dyn CompletionProvider>,
    max_tokens: u32,
    cancel: CancellationToken,
}

impl Extractor {
    pub fn new(provider: Arc<dyn CompletionProvider>, max_tokens: u32, cancel: CancellationToken) -> Self {
        Self {
            provider,
            max_tokens,
            cancel,
        }
    }

    /// One completion call, no retries: a bad answer is a content problem.
    pub async fn extract(&self, description: &str) -> Result<CanonicalJobRecord, ExtractError> {
        if description.trim().is_empty() {
            return Err(ExtractError::EmptyDescription);
        }
        let prompt = build_prompt(description);
        debug!(model = self.provider.model_name(), chars = prompt.len(), "requesting extraction");

        let raw = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ExtractError::Cancelled),
            response = self.provider.complete(&prompt, self.max_tokens) => {
                response.map_err(|e| ExtractError::Provider(format!("{:#}", e)))?
            }
        };

        let record = parse_response(&raw);
        if let Err(e) = &record {
            warn!(error = %e, "could not parse model response");
        }
        record
    }
}

/// Parse the first JSON object embedded in `text`, trying each `{` in turn so
/// prose braces before the real answer are skipped.
///
/// `None` when the text has no `{` at all. When nothing parses, the error of the
/// first candidate is returned. A candidate cut off by the end of the text stops
/// the scan: everything after it lies inside that unfinished object.
pub fn first_json_object(text: &str) -> Option<Result<Value, serde_json::Error>> {
    let mut first_error = None;
    for (start, _) in text.match_indices('{') {
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) if value.is_object() => return Some(Ok(value)),
            Some(Err(e)) => {
                let truncated = e.is_eof();
                first_error.get_or_insert(e);
                if truncated {
                    break;
                }
            }
            _ => {}
        }
    }
    first_error.map(Err)
}

pub fn parse_response(raw: &str) -> Result<CanonicalJobRecord, ExtractError> {
    let value = match first_json_object(raw) {
        Some(Ok(value)) => value,
        Some(Err(source)) => {
            return Err(ExtractError::Malformed {
                raw: raw.to_string(),
                source,
            })
        }
        None => {
            return Err(ExtractError::NoJson {
                raw: raw.to_string(),
            })
        }
    };
    let parsed: RawRecord =
        serde_json::from_value(lowercase_keys(value)).map_err(|source| ExtractError::Schema {
            raw: raw.to_string(),
            source,
        })?;
    Ok(parsed.into_canonical())
}

fn lowercase_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k.trim().to_lowercase(), lowercase_keys(v)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(lowercase_keys).collect()),
        other => other,
    }
}

// --- Wire schema as the model writes it ---

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    let text = match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        Some(Value::Array(items)) => Some(
            items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(", "),
        ),
        Some(Value::Object(_)) => {
            return Err(de::Error::custom("expected text, found an object"));
        }
    };
    Ok(text)
}

fn or_sentinel(value: Option<String>) -> String {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(unspecified)
}

#[derive(Debug, Default, Deserialize)]
struct RawPrincipal {
    #[serde(default, deserialize_with = "lenient_text")]
    nombre_puesto: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    empresa: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    lugar: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    tipo_contrato: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    link_publicacion: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    fecha_publicacion: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    nivel_puesto: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    industria: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    fuente_publicacion: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    salario_estimado: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    fecha_cierre: Option<String>,
}

impl From<RawPrincipal> for Principal {
    fn from(raw: RawPrincipal) -> Self {
        Principal {
            title: or_sentinel(raw.nombre_puesto),
            company: or_sentinel(raw.empresa),
            location: or_sentinel(raw.lugar),
            contract_type: or_sentinel(raw.tipo_contrato),
            link: or_sentinel(raw.link_publicacion),
            published: or_sentinel(raw.fecha_publicacion),
            seniority: or_sentinel(raw.nivel_puesto),
            industry: or_sentinel(raw.industria),
            source: or_sentinel(raw.fuente_publicacion),
            salary: or_sentinel(raw.salario_estimado),
            closing_date: or_sentinel(raw.fecha_cierre),
        }
    }
}

/// Some answers wrap the principal object in a one-element list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

#[derive(Debug, Deserialize)]
struct RawRequirement {
    #[serde(default, deserialize_with = "lenient_text")]
    tipo_requerimiento: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    tecnologia: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    nivel_o_anos: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBenefit {
    #[serde(default, deserialize_with = "lenient_text")]
    beneficio: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawActivity {
    #[serde(default, deserialize_with = "lenient_text")]
    actividad: Option<String>,
}

/// List entries may be full objects or bare strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Entry<T> {
    Full(T),
    Bare(String),
}

#[derive(Debug, Default, Deserialize)]
struct RawRecord {
    #[serde(default, alias = "principal")]
    tabla_principal: Option<OneOrMany<RawPrincipal>>,
    #[serde(default, alias = "requerimientos", alias = "requirements")]
    tabla_requerimientos: Option<Vec<Entry<RawRequirement>>>,
    #[serde(default, alias = "beneficios", alias = "benefits")]
    tabla_beneficios: Option<Vec<Entry<RawBenefit>>>,
    #[serde(default, alias = "actividades", alias = "activities")]
    tabla_actividades: Option<Vec<Entry<RawActivity>>>,
}

impl RawRecord {
    fn into_canonical(self) -> CanonicalJobRecord {
        let principal = match self.tabla_principal {
            Some(OneOrMany::One(p)) => p.into(),
            Some(OneOrMany::Many(list)) => list.into_iter().next().unwrap_or_default().into(),
            None => Principal::default(),
        };

        let requirements = self
            .tabla_requerimientos
            .unwrap_or_default()
            .into_iter()
            .map(|entry| match entry {
                Entry::Full(r) => Requirement {
                    category: or_sentinel(r.tipo_requerimiento),
                    technology: or_sentinel(r.tecnologia),
                    level_or_years: or_sentinel(r.nivel_o_anos),
                },
                Entry::Bare(text) => Requirement {
                    category: unspecified(),
                    technology: or_sentinel(Some(text)),
                    level_or_years: unspecified(),
                },
            })
            .collect();

        let benefits = self
            .tabla_beneficios
            .unwrap_or_default()
            .into_iter()
            .map(|entry| Benefit {
                benefit: match entry {
                    Entry::Full(b) => or_sentinel(b.beneficio),
                    Entry::Bare(text) => or_sentinel(Some(text)),
                },
            })
            .collect();

        let activities = self
            .tabla_actividades
            .unwrap_or_default()
            .into_iter()
            .map(|entry| Activity {
                activity: match entry {
                    Entry::Full(a) => or_sentinel(a.actividad),
                    Entry::Bare(text) => or_sentinel(Some(text)),
                },
            })
            .collect();

        CanonicalJobRecord {
            principal,
            requirements,
            benefits,
            activities,
        }
    }
}
