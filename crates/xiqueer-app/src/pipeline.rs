//! Capture pipeline: filter → extract → save → publish.

use chrono::Utc;
use tracing::{debug, error, info, warn};
use xiqueer_core::{contains_payload, digest_request_params, extract, NewSnapshot};
use xiqueer_proxy::{CaptureState, CaptureStateCell, CapturedExchange};
use xiqueer_storage::Database;

use crate::settings::CaptureSettings;

/// Characters of an unexpected response body shown in the log.
const LOG_PREVIEW_CHARS: usize = 120;

/// What happened to one captured exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Not the timetable endpoint.
    Ignored,
    /// Timetable endpoint, but no payload marker in the body.
    NoPayload,
    /// Payload present but a mandatory field was missing.
    ExtractionFailed,
    /// Snapshot stored under this id.
    Saved(i64),
    /// The store rejected the snapshot.
    StoreFailed(String),
}

/// Turns captured exchanges into stored snapshots.
#[derive(Clone)]
pub struct CapturePipeline {
    db: Database,
    state: CaptureStateCell,
    target_host: String,
    target_path_part: String,
}

impl std::fmt::Debug for CapturePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturePipeline")
            .field("target_host", &self.target_host)
            .field("target_path_part", &self.target_path_part)
            .finish()
    }
}

impl CapturePipeline {
    pub fn new(db: Database, state: CaptureStateCell, settings: &CaptureSettings) -> Self {
        Self {
            db,
            state,
            target_host: settings.target_host.trim().to_ascii_lowercase(),
            target_path_part: settings.target_path_part.clone(),
        }
    }

    /// Whether the exchange is a timetable request.
    pub fn is_target(&self, exchange: &CapturedExchange) -> bool {
        exchange.host == self.target_host && exchange.path.contains(&self.target_path_part)
    }

    /// Processes one exchange.
    pub fn handle(&self, exchange: &CapturedExchange) -> CaptureOutcome {
        if !self.is_target(exchange) {
            debug!("Ignoring {}{}", exchange.host, exchange.path);
            return CaptureOutcome::Ignored;
        }

        if !contains_payload(&exchange.response_body) {
            let preview: String = exchange.response_body.chars().take(LOG_PREVIEW_CHARS).collect();
            warn!(
                "Timetable response from {} has no payload: {:?}",
                exchange.path, preview
            );
            return CaptureOutcome::NoPayload;
        }

        let Some(parsed) = extract(&exchange.response_body) else {
            warn!("Timetable payload from {} is missing required fields", exchange.path);
            return CaptureOutcome::ExtractionFailed;
        };

        let captured_at = Utc::now();
        let snapshot = NewSnapshot {
            captured_at,
            host: exchange.host.clone(),
            path: exchange.path.clone(),
            academic_year: parsed.academic_year,
            term: parsed.term,
            week_no: parsed.week_no,
            max_week: parsed.max_week,
            period_start: parsed.period_start,
            period_end: parsed.period_end,
            request_digest: digest_request_params(&exchange.request_body),
            courses: parsed.courses,
        };

        match self.db.save_snapshot(&snapshot) {
            Ok(id) => {
                info!(
                    "Captured {}-{} week {} ({} courses) as snapshot {}",
                    snapshot.academic_year,
                    snapshot.term,
                    snapshot.week_no,
                    snapshot.courses.len(),
                    id
                );
                self.state.update(|s| CaptureState {
                    captured_count: s.captured_count + 1,
                    last_capture_at: Some(captured_at),
                    last_error: None,
                    ..s.clone()
                });
                CaptureOutcome::Saved(id)
            }
            Err(e) => {
                error!("Failed to save snapshot: {}", e);
                let message = format!("failed to save snapshot: {}", e);
                self.state.update(|s| CaptureState {
                    last_error: Some(message.clone()),
                    ..s.clone()
                });
                CaptureOutcome::StoreFailed(message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = "{jcflag:'0',maxzc:'18',zc:'3',xn:'2025',xq:'1',qssj:'2026-03-16',jssj:'2026-03-22',week2:[{kcmc:'Web前端开发技术',rkjs:'田赛超',skdd:'教学楼2-409',jcxx:'7-8'}],sjhjinfo:[]}";

    fn pipeline() -> (CapturePipeline, Database, CaptureStateCell) {
        let db = Database::in_memory().unwrap();
        let state = CaptureStateCell::new();
        let pipeline = CapturePipeline::new(db.clone(), state.clone(), &CaptureSettings::default());
        (pipeline, db, state)
    }

    fn exchange(host: &str, path: &str, response_body: &str) -> CapturedExchange {
        CapturedExchange {
            host: host.to_string(),
            path: path.to_string(),
            request_body: "param=abc&param2=de".to_string(),
            response_body: response_body.to_string(),
        }
    }

    #[test]
    fn saves_matching_exchange() {
        let (pipeline, db, state) = pipeline();

        let outcome = pipeline.handle(&exchange(
            "jw.xxgc.edu.cn",
            "/jwweb//wap/mycourseschedule.aspx?week=3",
            BODY,
        ));

        let CaptureOutcome::Saved(id) = outcome else {
            panic!("expected a saved snapshot, got {:?}", outcome);
        };
        let stored = db.get_snapshot(id).unwrap().unwrap();
        assert_eq!(stored.week_no, 3);
        assert_eq!(stored.academic_year, "2025");
        assert_eq!(stored.request_digest, "6d74a0db62:3/2");
        assert_eq!(stored.courses.len(), 1);
        assert_eq!(stored.courses[0].weekday, 2);

        let now = state.snapshot();
        assert_eq!(now.captured_count, 1);
        assert!(now.last_capture_at.is_some());
        assert!(now.last_error.is_none());
    }

    #[test]
    fn recapture_of_same_week_keeps_one_snapshot() {
        let (pipeline, db, state) = pipeline();
        let ex = exchange("jw.xxgc.edu.cn", "/jwweb//wap/mycourseschedule.aspx", BODY);

        let first = pipeline.handle(&ex);
        let second = pipeline.handle(&ex);

        assert_eq!(first, second);
        assert_eq!(db.snapshot_count().unwrap(), 1);
        assert_eq!(state.snapshot().captured_count, 2);
    }

    #[test]
    fn other_hosts_and_paths_are_ignored() {
        let (pipeline, db, state) = pipeline();

        assert_eq!(
            pipeline.handle(&exchange("api.xiqueer.com", "/jwweb//wap/mycourseschedule.aspx", BODY)),
            CaptureOutcome::Ignored
        );
        assert_eq!(
            pipeline.handle(&exchange("jw.xxgc.edu.cn", "/jwweb/other.aspx", BODY)),
            CaptureOutcome::Ignored
        );
        assert_eq!(db.snapshot_count().unwrap(), 0);
        assert_eq!(state.snapshot().captured_count, 0);
    }

    #[test]
    fn body_without_marker_is_skipped() {
        let (pipeline, db, _) = pipeline();

        let outcome = pipeline.handle(&exchange(
            "jw.xxgc.edu.cn",
            "/jwweb//wap/mycourseschedule.aspx",
            "<html>login required</html>",
        ));

        assert_eq!(outcome, CaptureOutcome::NoPayload);
        assert_eq!(db.snapshot_count().unwrap(), 0);
    }

    #[test]
    fn missing_mandatory_field_is_skipped() {
        let (pipeline, db, state) = pipeline();

        let outcome = pipeline.handle(&exchange(
            "jw.xxgc.edu.cn",
            "/jwweb//wap/mycourseschedule.aspx",
            "{jcflag:'0',zc:'3',xq:'1',week1:[],sjhjinfo:[]}",
        ));

        assert_eq!(outcome, CaptureOutcome::ExtractionFailed);
        assert_eq!(db.snapshot_count().unwrap(), 0);
        assert!(state.snapshot().last_error.is_none());
    }

    #[test]
    fn target_host_setting_is_case_insensitive() {
        let db = Database::in_memory().unwrap();
        let settings = CaptureSettings {
            target_host: "JW.Example.EDU".to_string(),
            ..CaptureSettings::default()
        };
        let pipeline = CapturePipeline::new(db, CaptureStateCell::new(), &settings);

        assert!(pipeline.is_target(&exchange(
            "jw.example.edu",
            "/jwweb//wap/mycourseschedule.aspx",
            ""
        )));
    }
}
