use serde::{Deserialize, Serialize};

/// Placeholder stored for any structured attribute the posting does not state.
pub const UNSPECIFIED: &str = "No se especifica";

/// Tag stamped on every listing produced by the crawler.
pub const SOURCE_TAG: &str = "LinkedIn";

pub fn unspecified() -> String {
    UNSPECIFIED.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub job_title: String,
    pub country_code: String,
}

impl SearchQuery {
    pub fn new(job_title: &str, country_code: &str) -> Self {
        Self {
            job_title: job_title.trim().to_string(),
            country_code: country_code.trim().to_uppercase(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub title: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub posted: Option<String>,
    pub link: String,
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_source() -> String {
    SOURCE_TAG.to_string()
}

impl ListingRecord {
    /// A bare listing for a link supplied directly by the user.
    pub fn from_link(link: &str) -> Self {
        Self {
            title: None,
            company: None,
            location: None,
            posted: None,
            link: link.trim().to_string(),
            source: default_source(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailRecord {
    #[serde(flatten)]
    pub listing: ListingRecord,
    pub description: Option<String>,
    pub applicants: Option<String>,
    pub posted_date: Option<String>,
    /// `posted_date` resolved to YYYY-MM-DD when it is a relative phrase we understand.
    #[serde(default)]
    pub posted_at: Option<String>,
}

impl DetailRecord {
    pub fn from_listing(listing: ListingRecord) -> Self {
        Self {
            listing,
            description: None,
            applicants: None,
            posted_date: None,
            posted_at: None,
        }
    }

    pub fn link(&self) -> &str {
        &self.listing.link
    }
}

// Wire names below are the column names the dashboards read.

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    #[serde(rename = "nombre_puesto", default = "unspecified")]
    pub title: String,
    #[serde(rename = "empresa", default = "unspecified")]
    pub company: String,
    #[serde(rename = "lugar", default = "unspecified")]
    pub location: String,
    #[serde(rename = "tipo_contrato", default = "unspecified")]
    pub contract_type: String,
    #[serde(rename = "link_publicacion", default = "unspecified")]
    pub link: String,
    #[serde(rename = "fecha_publicacion", default = "unspecified")]
    pub published: String,
    #[serde(rename = "nivel_puesto", default = "unspecified")]
    pub seniority: String,
    #[serde(rename = "industria", default = "unspecified")]
    pub industry: String,
    #[serde(rename = "fuente_publicacion", default = "unspecified")]
    pub source: String,
    #[serde(rename = "salario_estimado", default = "unspecified")]
    pub salary: String,
    #[serde(rename = "fecha_cierre", default = "unspecified")]
    pub closing_date: String,
}

impl Default for Principal {
    fn default() -> Self {
        Self {
            title: unspecified(),
            company: unspecified(),
            location: unspecified(),
            contract_type: unspecified(),
            link: unspecified(),
            published: unspecified(),
            seniority: unspecified(),
            industry: unspecified(),
            source: unspecified(),
            salary: unspecified(),
            closing_date: unspecified(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Requirement {
    #[serde(rename = "tipo_requerimiento", default = "unspecified")]
    pub category: String,
    #[serde(rename = "tecnologia", default = "unspecified")]
    pub technology: String,
    #[serde(rename = "nivel_o_anos", default = "unspecified")]
    pub level_or_years: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Benefit {
    #[serde(rename = "beneficio", default = "unspecified")]
    pub benefit: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Activity {
    #[serde(rename = "actividad", default = "unspecified")]
    pub activity: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalJobRecord {
    #[serde(rename = "tabla_principal", default)]
    pub principal: Principal,
    #[serde(rename = "tabla_requerimientos", default)]
    pub requirements: Vec<Requirement>,
    #[serde(rename = "tabla_beneficios", default)]
    pub benefits: Vec<Benefit>,
    #[serde(rename = "tabla_actividades", default)]
    pub activities: Vec<Activity>,
}

impl CanonicalJobRecord {
    /// Fill principal attributes the model left unspecified from scraped page data.
    pub fn backfill(&mut self, detail: &DetailRecord) {
        let p = &mut self.principal;
        fill(&mut p.title, detail.listing.title.as_deref());
        fill(&mut p.company, detail.listing.company.as_deref());
        fill(&mut p.location, detail.listing.location.as_deref());
        fill(&mut p.link, Some(detail.listing.link.as_str()));
        fill(
            &mut p.published,
            detail.posted_at.as_deref().or(detail.listing.posted.as_deref()),
        );
        fill(&mut p.source, Some(detail.listing.source.as_str()));
    }
}

fn fill(slot: &mut String, value: Option<&str>) {
    if slot != UNSPECIFIED {
        return;
    }
    if let Some(v) = value.map(str::trim).filter(|v| !v.is_empty()) {
        *slot = v.to_string();
    }
}

// --- Warehouse rows ---

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrincipalRow {
    pub job_id: u64,
    #[serde(flatten)]
    pub principal: Principal,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequirementRow {
    pub job_id: u64,
    #[serde(flatten)]
    pub requirement: Requirement,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BenefitRow {
    pub job_id: u64,
    #[serde(flatten)]
    pub benefit: Benefit,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivityRow {
    pub job_id: u64,
    #[serde(flatten)]
    pub activity: Activity,
}
