use tracing::{debug, info, warn};

use crate::browser::{BrowserSession, Probe};
use crate::config::CountryConfig;
use crate::models::{ListingRecord, SearchQuery, SOURCE_TAG};
use crate::navigator::{NavError, Navigator};

pub const RESULTS_LIST: &str = ".jobs-search__results-list";
pub const JOB_CARD: &str = "li:has(> div.base-card)";
pub const NEXT_BUTTON: &str = "button[aria-label=\"Next\"]";

const CARD_TITLE: Probe = Probe::text("h3.base-search-card__title");
const CARD_COMPANY: Probe = Probe::text("h4.base-search-card__subtitle a");
const CARD_LOCATION: Probe = Probe::text("span.job-search-card__location");
const CARD_POSTED: Probe = Probe::attr("time.job-search-card__listdate", "datetime");
const CARD_LINK: Probe = Probe::attr("a.base-card__full-link", "href");

/// Probe order matches the positional fields consumed by [`card_to_listing`].
pub const CARD_PROBES: [Probe; 5] = [CARD_TITLE, CARD_COMPANY, CARD_LOCATION, CARD_POSTED, CARD_LINK];

pub fn search_url(country: &CountryConfig, job_title: &str) -> String {
    let keywords: String = url::form_urlencoded::byte_serialize(job_title.trim().as_bytes()).collect();
    format!(
        "{}?keywords={}&location={}&geoId={}{}",
        country.base_url, keywords, country.location, country.geo_id, country.filters
    )
}

/// Map one card's probe values to a listing. Missing fields stay `None`;
/// a card without a link cannot be joined to detail data and is dropped.
pub fn card_to_listing(fields: &[Option<String>]) -> Option<ListingRecord> {
    let field = |i: usize| fields.get(i).cloned().flatten();
    let link = field(4)?;
    Some(ListingRecord {
        title: field(0),
        company: field(1),
        location: field(2),
        posted: field(3),
        link: strip_tracking(&link),
        source: SOURCE_TAG.to_string(),
    })
}

/// Search-card links carry per-impression tracking parameters; the path identifies the job.
fn strip_tracking(link: &str) -> String {
    match url::Url::parse(link) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => link.to_string(),
    }
}

pub struct ListingCrawler<'a> {
    navigator: &'a mut Navigator,
    max_pages: usize,
}

impl<'a> ListingCrawler<'a> {
    pub fn new(navigator: &'a mut Navigator, max_pages: usize) -> Self {
        Self {
            navigator,
            max_pages: max_pages.max(1),
        }
    }

    /// Crawl up to `max_pages` result pages for one query, in page order.
    ///
    /// Failing to load the first page is an error; running out of pages is not.
    pub async fn crawl(
        &mut self,
        session: &mut dyn BrowserSession,
        query: &SearchQuery,
        country: &CountryConfig,
    ) -> Result<Vec<ListingRecord>, NavError> {
        let url = search_url(country, &query.job_title);
        info!(title = %query.job_title, country = %query.country_code, %url, "searching");

        self.navigator
            .navigate_and_wait(session, &url, RESULTS_LIST)
            .await?;

        let mut results = Vec::new();
        for page in 1..=self.max_pages {
            let cards = match session.probe_each(JOB_CARD, &CARD_PROBES).await {
                Ok(cards) => cards,
                Err(e) => {
                    warn!(page, error = %e, "could not read job cards, stopping pagination");
                    break;
                }
            };
            let before = results.len();
            results.extend(cards.iter().filter_map(|card| card_to_listing(card)));
            debug!(page, cards = cards.len(), kept = results.len() - before, "page extracted");

            if page == self.max_pages {
                break;
            }
            match session.is_visible(NEXT_BUTTON).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!(page, error = %e, "could not check for next page");
                    break;
                }
            }
            if let Err(e) = session.click(NEXT_BUTTON).await {
                warn!(page, error = %e, "next page click failed, keeping results so far");
                break;
            }
            let delay = self.navigator.policy().request_delay;
            self.navigator.pause(delay).await?;
        }

        info!(country = %query.country_code, jobs = results.len(), "search finished");
        Ok(results)
    }
}
