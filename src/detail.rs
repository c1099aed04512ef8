use chrono::Local;
use tracing::{debug, info, warn};

use crate::browser::{BrowserDriver, BrowserSession, Probe};
use crate::models::{DetailRecord, ListingRecord};
use crate::navigator::{NavError, Navigator};
use crate::posted;

pub const TOP_CARD: &str = "section.top-card-layout";

const TITLE: Probe = Probe::text("h1.top-card-layout__title");
const COMPANY: Probe = Probe::text("a.topcard__org-name-link");
const LOCATION: Probe = Probe::text("span.topcard__flavor--bullet");
const POSTED_DATE: Probe = Probe::text("span.posted-time-ago__text");
const APPLICANTS: Probe = Probe::text("span.num-applicants__caption");

const PRIMARY_DESCRIPTION: &str =
    "div.job-details-jobs-unified-top-card__primary-description-container";
const PRIMARY_ITEM: &str = "span.tvm__text--low-emphasis";

pub const DESCRIPTION: &str = "section.description";
// Fallbacks for layouts that do not render the guest description section.
const DESCRIPTION_FALLBACKS: [&str; 3] = [
    ".show-more-less-html__markup",
    ".jobs-description__content",
    "#job-details",
];

async fn lookup(session: &mut dyn BrowserSession, probe: &Probe) -> Option<String> {
    match session.probe(probe).await {
        Ok(value) => value,
        Err(e) => {
            debug!(selector = probe.selector, error = %e, "lookup failed");
            None
        }
    }
}

fn overlay(slot: &mut Option<String>, value: Option<String>) {
    if value.is_some() {
        *slot = value;
    }
}

/// Structured sub-elements win over the summary header when there are at least three.
pub fn apply_primary_description(detail: &mut DetailRecord, items: &[String]) -> bool {
    if items.len() < 3 {
        return false;
    }
    let clean = |s: &String| Some(s.trim().to_string()).filter(|s| !s.is_empty());
    overlay(&mut detail.listing.location, clean(&items[0]));
    overlay(&mut detail.posted_date, clean(&items[1]));
    overlay(&mut detail.applicants, clean(&items[2]));
    true
}

/// Open a fresh session for `listing.link` and scrape the posting.
///
/// `Ok(None)` means the page could not be loaded after retries (already
/// logged). `Err` is reserved for run-level conditions: cancellation and
/// configuration errors.
pub async fn fetch_detail(
    navigator: &mut Navigator,
    driver: &dyn BrowserDriver,
    listing: &ListingRecord,
) -> Result<Option<DetailRecord>, NavError> {
    let mut session = match driver.open(navigator.current_identity()).await {
        Ok(session) => session,
        Err(e) => {
            warn!(link = %listing.link, error = %e, "could not open browser session");
            return Ok(None);
        }
    };

    let result = scrape(navigator, session.as_mut(), listing).await;
    if let Err(e) = session.close().await {
        debug!(error = %e, "closing detail session failed");
    }

    match result {
        Ok(detail) => Ok(Some(detail)),
        Err(e) if e.is_run_fatal() => Err(e),
        Err(e) => {
            warn!(link = %listing.link, error = %e, "skipping job detail");
            Ok(None)
        }
    }
}

async fn scrape(
    navigator: &mut Navigator,
    session: &mut dyn BrowserSession,
    listing: &ListingRecord,
) -> Result<DetailRecord, NavError> {
    navigator
        .navigate_and_wait(session, &listing.link, TOP_CARD)
        .await?;

    let mut detail = DetailRecord::from_listing(listing.clone());
    overlay(&mut detail.listing.title, lookup(session, &TITLE).await);
    overlay(&mut detail.listing.company, lookup(session, &COMPANY).await);
    overlay(&mut detail.listing.location, lookup(session, &LOCATION).await);
    detail.posted_date = lookup(session, &POSTED_DATE).await;
    detail.applicants = lookup(session, &APPLICANTS).await;

    match session.texts_within(PRIMARY_DESCRIPTION, PRIMARY_ITEM).await {
        Ok(Some(items)) => {
            if apply_primary_description(&mut detail, &items) {
                debug!(link = %listing.link, "using structured top-card fields");
            }
        }
        Ok(None) => {}
        Err(e) => debug!(error = %e, "structured top card unreadable"),
    }

    detail.description = description(navigator, session).await?;
    if detail.description.is_none() {
        warn!(link = %listing.link, "no description section found");
    }

    detail.posted_at = detail
        .posted_date
        .as_deref()
        .and_then(|text| posted::resolve_date(text, Local::now().naive_local()));

    info!(
        link = %listing.link,
        title = detail.listing.title.as_deref().unwrap_or("-"),
        has_description = detail.description.is_some(),
        "detail extracted"
    );
    Ok(detail)
}

async fn description(
    navigator: &Navigator,
    session: &mut dyn BrowserSession,
) -> Result<Option<String>, NavError> {
    let timeout = navigator.policy().timeout;
    let waited = tokio::select! {
        biased;
        _ = navigator.cancel_token().cancelled() => return Err(NavError::Cancelled),
        waited = session.wait_for(DESCRIPTION, timeout) => waited,
    };
    if waited.is_ok() {
        if let Some(text) = lookup(session, &Probe::text(DESCRIPTION)).await {
            return Ok(Some(text));
        }
    }
    for selector in DESCRIPTION_FALLBACKS {
        if let Some(text) = lookup(session, &Probe::text(selector)).await {
            return Ok(Some(text));
        }
    }
    Ok(None)
}
