use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifacts::{self, ArtifactError, ArtifactStore};
use crate::browser::{BrowserDriver, BrowserError};
use crate::config::{Config, ConfigError, CountryConfig};
use crate::detail;
use crate::extract::{ExtractError, Extractor};
use crate::listing::ListingCrawler;
use crate::models::{CanonicalJobRecord, ListingRecord, SearchQuery};
use crate::navigator::{NavError, Navigator, RetryPolicy};
use crate::rotator::IdentityRotator;
use crate::warehouse::Warehouse;

const EVENT_BUFFER: usize = 32;

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("could not open a browser session: {0}")]
    Session(#[from] BrowserError),

    #[error(transparent)]
    Nav(NavError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("run cancelled")]
    Cancelled,
}

impl From<NavError> for RunError {
    fn from(e: NavError) -> Self {
        match e {
            NavError::Config(e) => RunError::Config(e),
            NavError::Cancelled => RunError::Cancelled,
            other => RunError::Nav(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Searching,
    HistoricalReplay,
    Detailing,
    Extracting,
    Loading,
    Done,
}

impl RunState {
    pub fn can_advance_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, Searching | HistoricalReplay | Detailing)
                | (Searching, Searching | Detailing | Done)
                | (HistoricalReplay, Detailing | Done)
                | (Detailing, Detailing | Extracting | Done)
                | (Extracting, Loading | Detailing | Done)
                | (Loading, Detailing | Searching | Done)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Loaded { link: String, job_id: u64 },
    /// `stage` is where the job dropped out of the pipeline.
    Skipped {
        link: String,
        stage: RunState,
        reason: String,
    },
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub listings: usize,
    pub listings_path: Option<PathBuf>,
    /// Country codes whose first search page never loaded, with the error.
    pub failed_countries: Vec<(String, String)>,
    pub outcomes: Vec<JobOutcome>,
    pub warehouse_files: Vec<PathBuf>,
    pub interrupted: bool,
}

impl RunSummary {
    pub fn loaded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, JobOutcome::Loaded { .. }))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes.len() - self.loaded()
    }
}

/// Records `[offset, offset + count)` clamped to what is available.
pub fn replay_window(len: usize, offset: usize, count: usize) -> Range<usize> {
    let start = offset.min(len);
    let end = start.saturating_add(count).min(len);
    start..end
}

/// Keep the first listing seen for every link.
pub fn dedupe_by_link(listings: Vec<ListingRecord>) -> Vec<ListingRecord> {
    let mut seen = HashSet::new();
    listings
        .into_iter()
        .filter(|l| seen.insert(l.link.clone()))
        .collect()
}

// --- Workers ---

type SearchUnit = (usize, SearchQuery, CountryConfig);
type SearchResult = (usize, SearchQuery, Result<Vec<ListingRecord>, NavError>);

enum WorkerEvent {
    Extracted {
        link: String,
        record: CanonicalJobRecord,
    },
    Skipped {
        link: String,
        stage: RunState,
        reason: String,
        raw: Option<String>,
    },
}

/// What every worker task needs; each worker builds its own navigator from it.
#[derive(Clone)]
struct WorkerContext {
    config: Arc<Config>,
    driver: Arc<dyn BrowserDriver>,
    cancel: CancellationToken,
}

impl WorkerContext {
    fn navigator(&self) -> Navigator {
        Navigator::new(
            IdentityRotator::new(&self.config.proxies, self.config.crawl.rotation_interval),
            RetryPolicy::from_config(&self.config),
            self.cancel.clone(),
        )
    }

    /// Stop sibling workers after a run-fatal error.
    fn abort_on(&self, e: &RunError) {
        if !matches!(e, RunError::Cancelled) {
            self.cancel.cancel();
        }
    }
}

fn pop<T>(queue: &Mutex<VecDeque<T>>) -> Option<T> {
    queue.lock().ok()?.pop_front()
}

/// Keep the first run-fatal error, but let a real cause replace a bare cancellation.
fn record_fatal(slot: &mut Option<RunError>, e: RunError) {
    if slot.is_none() || matches!(slot, Some(RunError::Cancelled)) {
        *slot = Some(e);
    }
}

async fn search_worker(
    ctx: WorkerContext,
    worker: usize,
    queue: Arc<Mutex<VecDeque<SearchUnit>>>,
) -> Result<Vec<SearchResult>, RunError> {
    let mut navigator = ctx.navigator();
    let mut done = Vec::new();

    while let Some((index, query, country)) = pop(&queue) {
        let mut session = match ctx.driver.open(navigator.current_identity()).await {
            Ok(session) => session,
            Err(e) => {
                let e = RunError::Session(e);
                ctx.abort_on(&e);
                return Err(e);
            }
        };
        debug!(worker, country = %query.country_code, "search session opened");

        let result = ListingCrawler::new(&mut navigator, ctx.config.crawl.max_pages)
            .crawl(session.as_mut(), &query, &country)
            .await;
        if let Err(e) = session.close().await {
            debug!(worker, error = %e, "closing search session failed");
        }

        match result {
            Err(e) if e.is_run_fatal() => {
                let e = RunError::from(e);
                ctx.abort_on(&e);
                return Err(e);
            }
            result => done.push((index, query, result)),
        }
    }
    Ok(done)
}

/// Link each detail worker is working on; a worker that panics leaves its entry behind.
type InFlight = Arc<Mutex<HashMap<usize, String>>>;

fn set_in_flight(in_flight: &InFlight, worker: usize, link: Option<&str>) {
    if let Ok(mut map) = in_flight.lock() {
        match link {
            Some(link) => map.insert(worker, link.to_string()),
            None => map.remove(&worker),
        };
    }
}

fn take_stranded(in_flight: &InFlight) -> Vec<String> {
    in_flight
        .lock()
        .map(|mut map| map.drain().map(|(_, link)| link).collect())
        .unwrap_or_default()
}

async fn detail_worker(
    ctx: WorkerContext,
    extractor: Arc<Extractor>,
    worker: usize,
    queue: Arc<Mutex<VecDeque<ListingRecord>>>,
    in_flight: InFlight,
    events: mpsc::Sender<WorkerEvent>,
) -> Result<(), RunError> {
    let mut navigator = ctx.navigator();
    let mut processed = 0usize;

    while let Some(listing) = pop(&queue) {
        set_in_flight(&in_flight, worker, Some(&listing.link));
        if processed > 0 {
            let delay = navigator.policy().request_delay;
            if let Err(e) = navigator.pause(delay).await {
                set_in_flight(&in_flight, worker, None);
                return Err(e.into());
            }
        }
        processed += 1;

        let result = process_job(&ctx, &extractor, &mut navigator, listing).await;
        set_in_flight(&in_flight, worker, None);
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                ctx.abort_on(&e);
                return Err(e);
            }
        };
        if events.send(event).await.is_err() {
            break;
        }
    }
    debug!(worker, processed, "detail worker finished");
    Ok(())
}

async fn process_job(
    ctx: &WorkerContext,
    extractor: &Extractor,
    navigator: &mut Navigator,
    listing: ListingRecord,
) -> Result<WorkerEvent, RunError> {
    let link = listing.link.clone();
    let Some(detail) = detail::fetch_detail(navigator, ctx.driver.as_ref(), &listing).await? else {
        return Ok(WorkerEvent::Skipped {
            link,
            stage: RunState::Detailing,
            reason: "detail page could not be loaded".to_string(),
            raw: None,
        });
    };

    let description = detail.description.as_deref().unwrap_or_default();
    match extractor.extract(description).await {
        Ok(mut record) => {
            record.backfill(&detail);
            Ok(WorkerEvent::Extracted { link, record })
        }
        Err(ExtractError::Cancelled) => Err(RunError::Cancelled),
        Err(e) => {
            warn!(
                link = %link,
                error = %e,
                raw = e.raw_response().unwrap_or(""),
                "extraction failed, skipping job"
            );
            Ok(WorkerEvent::Skipped {
                link,
                stage: RunState::Extracting,
                reason: e.to_string(),
                raw: e.raw_response().map(str::to_string),
            })
        }
    }
}

// --- Controller ---

/// Sequences searches, detail fetching, extraction and loading.
///
/// The controller is the only owner of the warehouse: workers hand their
/// records over a channel and every load happens here, one job at a time.
pub struct RunController {
    config: Arc<Config>,
    driver: Arc<dyn BrowserDriver>,
    extractor: Option<Arc<Extractor>>,
    store: ArtifactStore,
    warehouse: Warehouse,
    cancel: CancellationToken,
    state: RunState,
    history: Vec<RunState>,
}

impl RunController {
    pub fn new(config: Arc<Config>, driver: Arc<dyn BrowserDriver>, cancel: CancellationToken) -> Self {
        let store = ArtifactStore::new(config.output.dir.clone());
        Self {
            warehouse: Warehouse::new(store.clone()),
            store,
            config,
            driver,
            extractor: None,
            cancel,
            state: RunState::Idle,
            history: vec![RunState::Idle],
        }
    }

    /// Required by every mode that goes past the search-results page.
    pub fn with_extractor(mut self, extractor: Arc<Extractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    #[cfg(test)]
    pub fn state(&self) -> RunState {
        self.state
    }

    /// States entered during the current run, starting from `Idle`.
    #[cfg(test)]
    pub fn history(&self) -> &[RunState] {
        &self.history
    }

    fn enter(&mut self, next: RunState) {
        if !self.state.can_advance_to(next) {
            warn!(from = ?self.state, to = ?next, "unexpected run state transition");
        }
        debug!(from = ?self.state, to = ?next, "run state");
        self.state = next;
        self.history.push(next);
    }

    fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            config: self.config.clone(),
            driver: self.driver.clone(),
            cancel: self.cancel.clone(),
        }
    }

    fn preflight(&mut self) -> Result<(), RunError> {
        self.state = RunState::Idle;
        self.history.clear();
        self.history.push(RunState::Idle);
        self.config.validate()?;
        if self.config.proxies.servers.is_empty() {
            return Err(ConfigError::EmptyProxyPool.into());
        }
        Ok(())
    }

    /// Bulk search over one or more countries, then (unless `search_only`)
    /// detail, extract and load every distinct listing found.
    pub async fn run_search(
        &mut self,
        job_title: &str,
        countries: &[String],
        search_only: bool,
    ) -> Result<RunSummary, RunError> {
        self.preflight()?;
        let units = countries
            .iter()
            .enumerate()
            .map(|(i, code)| {
                let country = self.config.country(code)?.clone();
                Ok((i, SearchQuery::new(job_title, code), country))
            })
            .collect::<Result<Vec<SearchUnit>, ConfigError>>()?;

        let mut summary = RunSummary::default();
        self.enter(RunState::Searching);
        let crawled = match self.crawl_all(units).await {
            Ok(crawled) => crawled,
            Err(RunError::Cancelled) => {
                summary.interrupted = true;
                self.enter(RunState::Done);
                return Ok(summary);
            }
            Err(e) => return Err(e),
        };

        let mut listings = Vec::new();
        for (query, result) in crawled {
            match result {
                Ok(found) => listings.extend(found),
                Err(e) => {
                    error!(country = %query.country_code, error = %e, "search failed for country");
                    summary.failed_countries.push((query.country_code, e.to_string()));
                }
            }
        }
        let listings = dedupe_by_link(listings);
        summary.listings = listings.len();
        if !listings.is_empty() {
            let path = self.store.save_listings(&listings)?;
            info!(jobs = listings.len(), path = %path.display(), "search results saved");
            summary.listings_path = Some(path);
        }

        if !search_only && !listings.is_empty() {
            self.enter(RunState::Detailing);
            self.process(listings, &mut summary).await?;
        }
        self.enter(RunState::Done);
        Ok(summary)
    }

    /// Re-run the detail pipeline over a saved search-results file.
    pub async fn run_replay(
        &mut self,
        path: &Path,
        offset: usize,
        count: usize,
    ) -> Result<RunSummary, RunError> {
        self.preflight()?;
        let listings = artifacts::read_listings(path)?;
        let window = replay_window(listings.len(), offset, count);
        info!(
            path = %path.display(),
            available = listings.len(),
            from = window.start,
            to = window.end,
            "replaying saved search"
        );

        self.enter(RunState::HistoricalReplay);
        let selected = listings[window].to_vec();
        let mut summary = RunSummary {
            listings: selected.len(),
            listings_path: Some(path.to_path_buf()),
            ..RunSummary::default()
        };
        if !selected.is_empty() {
            self.enter(RunState::Detailing);
            self.process(selected, &mut summary).await?;
        }
        self.enter(RunState::Done);
        Ok(summary)
    }

    /// Analyze one posting supplied by URL.
    pub async fn run_single(&mut self, link: &str) -> Result<RunSummary, RunError> {
        self.preflight()?;
        let mut summary = RunSummary {
            listings: 1,
            ..RunSummary::default()
        };
        self.enter(RunState::Detailing);
        self.process(vec![ListingRecord::from_link(link)], &mut summary)
            .await?;
        self.enter(RunState::Done);
        Ok(summary)
    }

    async fn crawl_all(
        &self,
        units: Vec<SearchUnit>,
    ) -> Result<Vec<(SearchQuery, Result<Vec<ListingRecord>, NavError>)>, RunError> {
        let workers = self.config.pool.effective_workers().min(units.len().max(1));
        let queue = Arc::new(Mutex::new(VecDeque::from(units)));

        let mut set = JoinSet::new();
        for worker in 0..workers {
            set.spawn(search_worker(self.worker_context(), worker, queue.clone()));
        }

        let mut results = Vec::new();
        let mut fatal = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(mut done)) => results.append(&mut done),
                Ok(Err(e)) => record_fatal(&mut fatal, e),
                Err(e) => error!(error = %e, "search worker panicked"),
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        results.sort_by_key(|(index, ..)| *index);
        Ok(results.into_iter().map(|(_, q, r)| (q, r)).collect())
    }

    /// Run listings through the worker pool and load what comes back.
    ///
    /// Loaded rows are flushed at the end even when the run is cut short.
    async fn process(
        &mut self,
        listings: Vec<ListingRecord>,
        summary: &mut RunSummary,
    ) -> Result<(), RunError> {
        let extractor = self.extractor.clone().ok_or(ConfigError::Invalid {
            field: "llm.model",
            reason: "no completion provider available".to_string(),
        })?;
        let queue = Arc::new(Mutex::new(VecDeque::from(listings)));
        let in_flight: InFlight = Arc::default();
        let mut fatal = None;

        // A panicking worker loses only the job it held; the rest of the
        // queue is picked up by a fresh round of workers.
        loop {
            let pending = queue.lock().map(|q| q.len()).unwrap_or(0);
            let workers = self.config.pool.effective_workers().min(pending);
            let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);

            let mut set = JoinSet::new();
            for worker in 0..workers {
                set.spawn(detail_worker(
                    self.worker_context(),
                    extractor.clone(),
                    worker,
                    queue.clone(),
                    in_flight.clone(),
                    tx.clone(),
                ));
            }
            drop(tx);

            while let Some(event) = rx.recv().await {
                self.sink(event, summary);
            }

            let mut panicked = 0usize;
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => record_fatal(&mut fatal, e),
                    Err(e) => {
                        error!(error = %e, "detail worker panicked");
                        panicked += 1;
                    }
                }
            }

            for link in take_stranded(&in_flight) {
                let event = WorkerEvent::Skipped {
                    link,
                    stage: RunState::Detailing,
                    reason: "worker panicked while processing this job".to_string(),
                    raw: None,
                };
                self.sink(event, summary);
            }

            let remaining = queue.lock().map(|q| q.len()).unwrap_or(0);
            if panicked == 0 || remaining == 0 || fatal.is_some() || self.cancel.is_cancelled() {
                break;
            }
            warn!(panicked, remaining, "restarting detail workers");
        }

        summary.warehouse_files.extend(self.warehouse.flush()?);
        match fatal {
            None => Ok(()),
            Some(RunError::Cancelled) => {
                warn!(loaded = summary.loaded(), "run interrupted");
                summary.interrupted = true;
                Ok(())
            }
            Some(e) => Err(e),
        }
    }

    fn sink(&mut self, event: WorkerEvent, summary: &mut RunSummary) {
        match event {
            WorkerEvent::Extracted { link, record } => {
                self.enter(RunState::Extracting);
                if let Err(e) = self.store.save_job(&record) {
                    warn!(link = %link, error = %e, "could not save job artifact");
                }
                self.enter(RunState::Loading);
                let job_id = self.warehouse.load(record);
                info!(job_id, link = %link, "job loaded");
                summary.outcomes.push(JobOutcome::Loaded { link, job_id });

                let every = self.config.pool.flush_every;
                if every > 0 && self.warehouse.pending_jobs() >= every {
                    match self.warehouse.flush() {
                        Ok(paths) => summary.warehouse_files.extend(paths),
                        Err(e) => warn!(error = %e, "periodic flush failed, rows kept for the next flush"),
                    }
                }
                self.enter(RunState::Detailing);
            }
            WorkerEvent::Skipped {
                link,
                stage,
                reason,
                raw,
            } => {
                if let Some(raw) = raw {
                    match self.store.save_diagnostic(&link, &raw) {
                        Ok(path) => debug!(path = %path.display(), "raw response kept"),
                        Err(e) => warn!(link = %link, error = %e, "could not save raw response"),
                    }
                }
                info!(link = %link, stage = ?stage, reason = %reason, "job skipped");
                summary.outcomes.push(JobOutcome::Skipped {
                    link,
                    stage,
                    reason,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::Probe;
    use crate::listing::{search_url, CARD_PROBES, RESULTS_LIST};
    use crate::testing::{FakePage, FakeProvider, FakeSite};
    use crate::warehouse::read_tables;
    use std::fs;
    use tempfile::TempDir;

    const ANSWER: &str = r#"{
        "tabla_principal": {"nombre_puesto": "Data Engineer", "empresa": "Acme"},
        "tabla_requerimientos": [{"tipo_requerimiento": "Cloud Computing", "tecnologia": "AWS", "nivel_o_anos": "2 años"}],
        "tabla_beneficios": [{"beneficio": "Remote work"}],
        "tabla_actividades": [{"actividad": "Build pipelines"}]
    }"#;

    fn config(dir: &Path, workers: usize) -> Config {
        let mut config = Config::default();
        config.proxies.servers = vec!["http://proxy1:8080".to_string()];
        config.output.dir = dir.to_path_buf();
        config.pool.workers = workers;
        config.pool.flush_every = 0;
        config
    }

    fn controller(config: Config, site: &FakeSite, provider: &FakeProvider) -> RunController {
        let cancel = CancellationToken::new();
        let extractor = Extractor::new(Arc::new(provider.clone()), 1024, cancel.clone());
        RunController::new(Arc::new(config), Arc::new(site.clone()), cancel)
            .with_extractor(Arc::new(extractor))
    }

    fn job_link(host: &str, id: usize) -> String {
        format!("https://{}/jobs/view/{}", host, id)
    }

    fn results_page(host: &str, ids: &[usize]) -> FakePage {
        ids.iter().fold(FakePage::new().with_selector(RESULTS_LIST), |page, id| {
            let title = format!("Job {}", id);
            let link = format!("{}?refId=abc", job_link(host, *id));
            page.with_item(&[(CARD_PROBES[0], title.as_str()), (CARD_PROBES[4], link.as_str())])
        })
    }

    fn detail_page() -> FakePage {
        FakePage::new()
            .with_selector(detail::TOP_CARD)
            .with_value(Probe::text(detail::DESCRIPTION), "Spark, Airflow and AWS.")
    }

    fn peru_search(site: FakeSite, ids: &[usize]) -> FakeSite {
        let url = search_url(Config::default().country("PE").unwrap(), "Data Engineer");
        let site = site.with_pages(&url, vec![results_page("pe.linkedin.com", ids)]);
        ids.iter().fold(site, |site, id| {
            site.with_pages(&job_link("pe.linkedin.com", *id), vec![detail_page()])
        })
    }

    fn provider(answers: usize) -> FakeProvider {
        (0..answers).fold(FakeProvider::new(), |p, _| p.respond(ANSWER))
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_loads_every_listing() {
        let tmp = TempDir::new().unwrap();
        let site = peru_search(FakeSite::new(), &[1, 2, 3]);
        let mut controller = controller(config(tmp.path(), 2), &site, &provider(3));

        let summary = controller
            .run_search("Data Engineer", &["PE".to_string()], false)
            .await
            .unwrap();

        assert_eq!(summary.listings, 3);
        assert_eq!(summary.loaded(), 3);
        assert!(!summary.interrupted);
        assert_eq!(controller.state(), RunState::Done);

        let mut ids: Vec<u64> = summary
            .outcomes
            .iter()
            .filter_map(|o| match o {
                JobOutcome::Loaded { job_id, .. } => Some(*job_id),
                _ => None,
            })
            .collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2, 3]);

        let tables = read_tables(&summary.warehouse_files).unwrap();
        assert_eq!(tables.principal.len(), 3);
        assert_eq!(tables.requirements.len(), 3);
        let saved = artifacts::read_listings(summary.listings_path.as_ref().unwrap()).unwrap();
        assert_eq!(saved.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backfill_fills_link_and_keeps_model_values() {
        let tmp = TempDir::new().unwrap();
        let site = peru_search(FakeSite::new(), &[7]);
        let mut controller = controller(config(tmp.path(), 1), &site, &provider(1));

        let summary = controller
            .run_search("Data Engineer", &["PE".to_string()], false)
            .await
            .unwrap();

        let tables = read_tables(&summary.warehouse_files).unwrap();
        let principal = &tables.principal[0].principal;
        assert_eq!(principal.title, "Data Engineer");
        assert_eq!(principal.link, job_link("pe.linkedin.com", 7));
        assert_eq!(principal.source, "LinkedIn");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_country_does_not_abort_others() {
        let tmp = TempDir::new().unwrap();
        // no pages for the US search URL: every attempt fails
        let site = peru_search(FakeSite::new(), &[1, 2]);
        let mut controller = controller(config(tmp.path(), 2), &site, &FakeProvider::new());

        let summary = controller
            .run_search("Data Engineer", &["PE".to_string(), "US".to_string()], true)
            .await
            .unwrap();

        assert_eq!(summary.listings, 2);
        assert_eq!(summary.failed_countries.len(), 1);
        assert_eq!(summary.failed_countries[0].0, "US");
        assert!(summary.outcomes.is_empty());
        assert!(summary.listings_path.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_country_is_fatal_before_any_navigation() {
        let tmp = TempDir::new().unwrap();
        let site = FakeSite::new();
        let mut controller = controller(config(tmp.path(), 2), &site, &FakeProvider::new());

        let err = controller
            .run_search("Data Engineer", &["PE".to_string(), "ZZ".to_string()], false)
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Config(ConfigError::UnknownCountry { .. })));
        assert!(site.navigations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_proxy_pool_is_fatal_at_start() {
        let tmp = TempDir::new().unwrap();
        let mut config = config(tmp.path(), 1);
        config.proxies.servers.clear();
        let site = FakeSite::new();
        let mut controller = controller(config, &site, &FakeProvider::new());

        let err = controller.run_single("https://pe.linkedin.com/jobs/view/1").await.unwrap_err();
        assert!(matches!(err, RunError::Config(ConfigError::EmptyProxyPool)));
        assert_eq!(site.sessions_opened(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_llm_response_skips_job_and_keeps_raw_text() {
        let tmp = TempDir::new().unwrap();
        let site = peru_search(FakeSite::new(), &[1, 2]);
        let provider = FakeProvider::new()
            .respond("Sorry, I cannot help with that.")
            .respond(ANSWER);
        let mut controller = controller(config(tmp.path(), 1), &site, &provider);

        let summary = controller
            .run_search("Data Engineer", &["PE".to_string()], false)
            .await
            .unwrap();

        assert_eq!(
            summary.outcomes[0],
            JobOutcome::Skipped {
                link: job_link("pe.linkedin.com", 1),
                stage: RunState::Extracting,
                reason: "response contains no JSON object".to_string(),
            }
        );
        assert_eq!(
            summary.outcomes[1],
            JobOutcome::Loaded {
                link: job_link("pe.linkedin.com", 2),
                job_id: 1,
            }
        );

        let diagnostics: Vec<_> = fs::read_dir(tmp.path().join(artifacts::DIAGNOSTICS_DIR))
            .unwrap()
            .collect();
        assert_eq!(diagnostics.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_detail_page_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let url = search_url(Config::default().country("PE").unwrap(), "Data Engineer");
        let site = FakeSite::new()
            .with_pages(&url, vec![results_page("pe.linkedin.com", &[1, 2])])
            .with_pages(&job_link("pe.linkedin.com", 2), vec![detail_page()]);
        let mut controller = controller(config(tmp.path(), 1), &site, &provider(1));

        let summary = controller
            .run_search("Data Engineer", &["PE".to_string()], false)
            .await
            .unwrap();

        assert_eq!(summary.loaded(), 1);
        assert_eq!(summary.skipped(), 1);
        assert!(matches!(
            &summary.outcomes[0],
            JobOutcome::Skipped { stage: RunState::Detailing, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_clamps_count_to_available_records() {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let saved: Vec<ListingRecord> = (1..=20)
            .map(|id| ListingRecord::from_link(&job_link("pe.linkedin.com", id)))
            .collect();
        let path = store.save_listings(&saved).unwrap();

        // no detail pages: every job is skipped, which is enough to see which ran
        let site = FakeSite::new();
        let mut controller = controller(config(tmp.path(), 2), &site, &FakeProvider::new());
        let summary = controller.run_replay(&path, 5, 100).await.unwrap();

        assert_eq!(summary.listings, 15);
        assert_eq!(summary.outcomes.len(), 15);
        let visited: HashSet<String> = site.navigations().into_iter().collect();
        let expected: HashSet<String> = (6..=20).map(|id| job_link("pe.linkedin.com", id)).collect();
        assert_eq!(visited, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_only_needs_no_extractor() {
        let tmp = TempDir::new().unwrap();
        let site = peru_search(FakeSite::new(), &[1, 2]);
        let cancel = CancellationToken::new();
        let mut controller =
            RunController::new(Arc::new(config(tmp.path(), 1)), Arc::new(site.clone()), cancel);

        let summary = controller
            .run_search("Data Engineer", &["PE".to_string()], true)
            .await
            .unwrap();
        assert_eq!(summary.listings, 2);

        let err = controller
            .run_single(&job_link("pe.linkedin.com", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Config(ConfigError::Invalid { field: "llm.model", .. })));
    }

    #[test]
    fn test_replay_window() {
        assert_eq!(replay_window(20, 5, 100), 5..20);
        assert_eq!(replay_window(20, 0, 3), 0..3);
        assert_eq!(replay_window(20, 25, 3), 20..20);
        assert_eq!(replay_window(0, 0, 10), 0..0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_job_analysis() {
        let tmp = TempDir::new().unwrap();
        let link = job_link("www.linkedin.com", 42);
        let site = FakeSite::new().with_pages(&link, vec![detail_page()]);
        let provider = provider(1);
        let mut controller = controller(config(tmp.path(), 2), &site, &provider);

        let summary = controller.run_single(&link).await.unwrap();

        assert_eq!(summary.outcomes, vec![JobOutcome::Loaded { link, job_id: 1 }]);
        assert_eq!(summary.warehouse_files.len(), 4);
        assert!(provider.prompts()[0].contains("Spark, Airflow and AWS."));
        assert_eq!(fs::read_dir(tmp.path().join(artifacts::JOB_DETAILS_DIR)).unwrap().count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_ids_continue_across_runs() {
        let tmp = TempDir::new().unwrap();
        let first = job_link("www.linkedin.com", 1);
        let second = job_link("www.linkedin.com", 2);
        let site = FakeSite::new()
            .with_pages(&first, vec![detail_page()])
            .with_pages(&second, vec![detail_page()]);
        let mut controller = controller(config(tmp.path(), 1), &site, &provider(2));

        controller.run_single(&first).await.unwrap();
        let summary = controller.run_single(&second).await.unwrap();
        assert_eq!(summary.outcomes, vec![JobOutcome::Loaded { link: second, job_id: 2 }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flush() {
        let tmp = TempDir::new().unwrap();
        let site = peru_search(FakeSite::new(), &[1, 2]);
        let mut config = config(tmp.path(), 1);
        config.pool.flush_every = 1;
        let mut controller = controller(config, &site, &provider(2));

        let summary = controller
            .run_search("Data Engineer", &["PE".to_string()], false)
            .await
            .unwrap();
        // two flushes of four tables, nothing left for the final one
        assert_eq!(summary.warehouse_files.len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_run_reports_interruption() {
        let tmp = TempDir::new().unwrap();
        let site = peru_search(FakeSite::new(), &[1]);
        let provider = provider(1);
        let cancel = CancellationToken::new();
        let extractor = Extractor::new(Arc::new(provider.clone()), 1024, cancel.clone());
        let mut controller =
            RunController::new(Arc::new(config(tmp.path(), 1)), Arc::new(site.clone()), cancel.clone())
                .with_extractor(Arc::new(extractor));

        cancel.cancel();
        let summary = controller
            .run_search("Data Engineer", &["PE".to_string()], false)
            .await
            .unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.listings, 0);
        assert!(provider.prompts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_panic_skips_only_the_job_in_hand() {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let links: Vec<String> = (1..=3).map(|id| job_link("pe.linkedin.com", id)).collect();
        let saved: Vec<ListingRecord> = links.iter().map(|l| ListingRecord::from_link(l)).collect();
        let path = store.save_listings(&saved).unwrap();

        let site = links
            .iter()
            .fold(FakeSite::new(), |site, link| site.with_pages(link, vec![detail_page()]));
        let provider = FakeProvider::new().panic_once().respond(ANSWER).respond(ANSWER);
        let mut controller = controller(config(tmp.path(), 1), &site, &provider);

        let summary = controller.run_replay(&path, 0, 3).await.unwrap();

        assert_eq!(summary.outcomes.len(), 3);
        assert!(matches!(
            &summary.outcomes[0],
            JobOutcome::Skipped { link, stage: RunState::Detailing, .. } if *link == links[0]
        ));
        assert_eq!(summary.loaded(), 2);
        assert!(!summary.interrupted);
        let tables = read_tables(&summary.warehouse_files).unwrap();
        assert_eq!(tables.principal.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loaded_job_walks_every_pipeline_state() {
        let tmp = TempDir::new().unwrap();
        let link = job_link("www.linkedin.com", 9);
        let site = FakeSite::new().with_pages(&link, vec![detail_page()]);
        let mut controller = controller(config(tmp.path(), 1), &site, &provider(1));

        controller.run_single(&link).await.unwrap();

        use RunState::*;
        assert_eq!(
            controller.history(),
            &[Idle, Detailing, Extracting, Loading, Detailing, Done]
        );
        assert!(controller
            .history()
            .windows(2)
            .all(|pair| pair[0].can_advance_to(pair[1])));
    }

    #[test]
    fn test_dedupe_keeps_first_occurrence() {
        let mut a = ListingRecord::from_link("https://x/jobs/view/1");
        a.title = Some("first".to_string());
        let mut b = ListingRecord::from_link("https://x/jobs/view/1");
        b.title = Some("second".to_string());
        let c = ListingRecord::from_link("https://x/jobs/view/2");

        let kept = dedupe_by_link(vec![a, b, c]);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].title.as_deref(), Some("first"));
    }

    #[test]
    fn test_state_transitions() {
        use RunState::*;
        assert!(Idle.can_advance_to(Searching));
        assert!(Idle.can_advance_to(HistoricalReplay));
        assert!(HistoricalReplay.can_advance_to(Detailing));
        assert!(Loading.can_advance_to(Searching));
        assert!(Loading.can_advance_to(Done));
        assert!(!Idle.can_advance_to(Loading));
        assert!(!Done.can_advance_to(Searching));
        assert!(!Searching.can_advance_to(Loading));
    }
}
