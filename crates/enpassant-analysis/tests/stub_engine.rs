//! End-to-end tests against a deterministic stub engine.
//!
//! The stub is a tiny shell script speaking just enough UCI to exercise
//! the orchestration paths: canned info/bestmove replies, configurable
//! crash and stall behavior, and a transcript log so tests can assert
//! exactly which commands reached the engine.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use enpassant_analysis::engine::EngineProcess;
use enpassant_analysis::{
    AnalysisError, AnalysisService, EngineConfig, MoveRequest, OptionUpdate, ServiceConfig,
    SessionUpdate,
};
use enpassant_uci::{MoveResponse, Variation, STARTPOS_FEN};
use serial_test::serial;

const STUB_SCRIPT: &str = r#"#!/bin/sh
LOG="$1"
MODE="${2:-normal}"
DELAY="${3:-0}"
PENDING=0
READY=0
while IFS= read -r line; do
  printf '%s\n' "$line" >> "$LOG"
  case "$line" in
    uci)
      echo "id name StubFish"
      echo "option name MultiPV type spin default 1 min 1 max 500"
      echo "option name Skill Level type spin default 20 min 0 max 20"
      echo "uciok"
      ;;
    isready)
      if [ "$MODE" = "deaf" ] && [ "$READY" -ge 1 ]; then
        :
      else
        echo "readyok"
      fi
      READY=$((READY+1))
      ;;
    go*)
      case "$MODE" in
        crash)
          exit 7
          ;;
        crash_once)
          if [ ! -e "$LOG.crashed" ]; then
            : > "$LOG.crashed"
            exit 7
          fi
          echo "info depth 10 multipv 1 score cp 20 pv e2e4"
          echo "bestmove e2e4 ponder e7e5"
          ;;
        waitstop)
          PENDING=1
          ;;
        mute)
          ;;
        chatty)
          ( i=1
            while [ "$i" -le 20 ]; do
              echo "info depth $i multipv 1 score cp 15 pv e2e4 e7e5"
              sleep 0.1
              i=$((i+1))
            done
            echo "bestmove e2e4 ponder e7e5" ) &
          ;;
        multipv)
          echo "info depth 10 multipv 1 score cp 51 pv e2e4 e7e5"
          echo "info depth 10 multipv 2 score cp 12 pv d2d4 d7d5"
          echo "info depth 12 multipv 1 score cp 64 pv e2e4 c7c5"
          echo "bestmove e2e4 ponder c7c5"
          ;;
        abandoned)
          echo "info depth 8 multipv 2 score mate 3 pv d1h5 g6h5"
          echo "info depth 20 multipv 1 score cp 100 pv e2e4 e7e5"
          echo "bestmove e2e4 ponder e7e5"
          ;;
        mate)
          echo "info depth 8 multipv 1 score mate 2 pv d1h5 g6h5"
          echo "info depth 8 multipv 2 score cp 310 pv e2e4"
          echo "info depth 8 multipv 3 score mate -4 pv a2a3"
          echo "bestmove d1h5"
          ;;
        *)
          if [ "$DELAY" != "0" ]; then
            sleep "$DELAY"
          fi
          echo "info depth 10 multipv 1 score cp 20 pv e2e4"
          echo "bestmove e2e4 ponder e7e5"
          ;;
      esac
      ;;
    stop)
      if [ "$PENDING" = "1" ]; then
        PENDING=0
        echo "info depth 3 multipv 1 score cp 5 pv e2e4"
        echo "bestmove e2e4 ponder e7e5"
      fi
      ;;
    quit)
      exit 0
      ;;
  esac
done
exit 0
"#;

struct StubHarness {
    dir: PathBuf,
    log: PathBuf,
}

impl StubHarness {
    fn new(test: &str, mode: &str, delay_secs: &str) -> (Self, EngineConfig) {
        let dir = std::env::temp_dir().join(format!(
            "enpassant-stub-{test}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).expect("create stub dir");
        let script = dir.join("stub.sh");
        fs::write(&script, STUB_SCRIPT).expect("write stub script");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755))
            .expect("chmod stub script");
        let log = dir.join("transcript.log");

        let mut cfg = EngineConfig::new(&script);
        cfg.args = vec![
            log.display().to_string(),
            mode.to_string(),
            delay_secs.to_string(),
        ];
        cfg.ready_timeout_ms = 5_000;
        cfg.quit_grace_ms = 200;
        (Self { dir, log }, cfg)
    }

    fn transcript(&self) -> String {
        fs::read_to_string(&self.log).unwrap_or_default()
    }

    fn count_lines_starting_with(&self, prefix: &str) -> usize {
        self.transcript()
            .lines()
            .filter(|l| l.starts_with(prefix))
            .count()
    }
}

impl Drop for StubHarness {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

fn service_config(
    engine: EngineConfig,
    slots: usize,
    queue: usize,
    retry_once: bool,
) -> ServiceConfig {
    let mut cfg = ServiceConfig::new(engine);
    cfg.pool.slots = slots;
    cfg.pool.queue_capacity = queue;
    cfg.pool.retry_once = retry_once;
    cfg.limits.depth = Some(10);
    cfg.limits.movetime_ms = None;
    cfg.limits.request_timeout_ms = 10_000;
    cfg.limits.stall_timeout_ms = 2_000;
    cfg
}

fn request(id: &str, multipv: i32) -> MoveRequest {
    MoveRequest {
        id: id.to_string(),
        starting_fen: STARTPOS_FEN.to_string(),
        moves: vec![],
        multipv,
    }
}

#[test]
#[serial]
fn startpos_single_pv_scenario() {
    let (stub, engine) = StubHarness::new("scenario", "normal", "0");
    let service = AnalysisService::new(service_config(engine, 1, 4, false)).unwrap();

    let response = service.request_move(request("s1", 1)).unwrap();
    assert_eq!(
        response,
        MoveResponse {
            id: "s1".to_string(),
            best_move: "e2e4".to_string(),
            ponder_move: "e7e5".to_string(),
            variations: vec![Variation {
                moves: vec!["e2e4".to_string()],
                score: 20,
                mate: 0,
            }],
        }
    );
    assert_eq!(response.best_move, response.variations[0].moves[0]);

    drop(service);
    assert_eq!(stub.count_lines_starting_with("position startpos"), 1);
    assert_eq!(stub.count_lines_starting_with("go"), 1);

    // handshake orders the game reset before the readiness sync
    let transcript = stub.transcript();
    let newgame = transcript.find("ucinewgame").expect("ucinewgame sent");
    let isready = transcript.find("isready").expect("isready sent");
    assert!(newgame < isready);
}

#[test]
#[serial]
fn multipv_returns_refined_ordered_variations() {
    let (_stub, engine) = StubHarness::new("multipv", "multipv", "0");
    let service = AnalysisService::new(service_config(engine, 1, 4, false)).unwrap();

    let response = service.request_move(request("s1", 2)).unwrap();
    assert_eq!(response.variations.len(), 2);
    // depth 12 refinement replaced the depth 10 line for index 1
    assert_eq!(response.variations[0].score, 64);
    assert_eq!(response.variations[0].moves, vec!["e2e4", "c7c5"]);
    assert_eq!(response.variations[1].score, 12);
    assert_eq!(response.best_move, response.variations[0].moves[0]);
    assert_eq!(response.ponder_move, "c7c5");
}

#[test]
#[serial]
fn mate_lines_rank_above_scores_and_mate_against_last() {
    let (_stub, engine) = StubHarness::new("mate", "mate", "0");
    let service = AnalysisService::new(service_config(engine, 1, 4, false)).unwrap();

    let response = service.request_move(request("s1", 3)).unwrap();
    assert_eq!(response.variations.len(), 3);
    assert_eq!(response.variations[0].mate, 2);
    assert_eq!(response.variations[1].score, 310);
    assert_eq!(response.variations[1].mate, 0);
    assert_eq!(response.variations[2].mate, -4);
    assert_eq!(response.best_move, "d1h5");
    assert_eq!(response.best_move, response.variations[0].moves[0]);
    assert_eq!(response.ponder_move, "");
}

#[test]
#[serial]
fn duplicate_id_rejected_while_active_then_reusable() {
    let (_stub, engine) = StubHarness::new("dup", "normal", "1");
    let service = Arc::new(AnalysisService::new(service_config(engine, 1, 4, false)).unwrap());

    let background = {
        let service = Arc::clone(&service);
        std::thread::spawn(move || service.request_move(request("s1", 1)))
    };
    std::thread::sleep(Duration::from_millis(300));

    let err = service.request_move(request("s1", 1)).unwrap_err();
    assert!(matches!(err, AnalysisError::AlreadyExists(_)));

    background.join().unwrap().unwrap();

    // id is free again once the first session reached a terminal state
    service.request_move(request("s1", 1)).unwrap();
}

#[test]
#[serial]
fn zero_capacity_queue_rejects_when_all_slots_busy() {
    let (_stub, engine) = StubHarness::new("saturate", "normal", "1");
    let service = Arc::new(AnalysisService::new(service_config(engine, 1, 0, false)).unwrap());

    let background = {
        let service = Arc::clone(&service);
        std::thread::spawn(move || service.request_move(request("s1", 1)))
    };
    std::thread::sleep(Duration::from_millis(400));

    let err = service.request_move(request("s2", 1)).unwrap_err();
    assert!(matches!(err, AnalysisError::PoolSaturated));

    background.join().unwrap().unwrap();

    // slot freed: the same request is admitted now
    service.request_move(request("s2", 1)).unwrap();
}

#[test]
#[serial]
fn queue_capacity_one_admits_and_serves_in_order() {
    let (_stub, engine) = StubHarness::new("queued", "normal", "1");
    let service = Arc::new(AnalysisService::new(service_config(engine, 1, 1, false)).unwrap());

    let first = {
        let service = Arc::clone(&service);
        std::thread::spawn(move || service.request_move(request("s1", 1)))
    };
    std::thread::sleep(Duration::from_millis(300));

    // admitted into the queue despite the busy slot, served afterwards
    let response = service.request_move(request("s2", 1)).unwrap();
    assert_eq!(response.id, "s2");
    first.join().unwrap().unwrap();
}

#[test]
#[serial]
fn cancelling_queued_session_never_touches_the_engine() {
    let (stub, engine) = StubHarness::new("cancel-queued", "waitstop", "0");
    let service = Arc::new(AnalysisService::new(service_config(engine, 1, 1, false)).unwrap());

    let first = {
        let service = Arc::clone(&service);
        std::thread::spawn(move || service.request_move(request("s1", 1)))
    };
    std::thread::sleep(Duration::from_millis(300));

    let second = {
        let service = Arc::clone(&service);
        std::thread::spawn(move || service.request_move(request("s2", 1)))
    };
    std::thread::sleep(Duration::from_millis(200));

    service.cancel("s2").unwrap();
    assert!(matches!(
        second.join().unwrap().unwrap_err(),
        AnalysisError::Cancelled
    ));

    // cancelling the running session stops its engine cleanly
    service.cancel("s1").unwrap();
    assert!(matches!(
        first.join().unwrap().unwrap_err(),
        AnalysisError::Cancelled
    ));

    drop(service);
    // only s1 ever reached the engine
    assert_eq!(stub.count_lines_starting_with("position"), 1);
    assert_eq!(stub.count_lines_starting_with("go"), 1);
    assert_eq!(stub.count_lines_starting_with("stop"), 1);
}

#[test]
#[serial]
fn engine_crash_surfaces_failure_and_slot_recovers() {
    let (_stub, engine) = StubHarness::new("crash", "crash_once", "0");
    let service = AnalysisService::new(service_config(engine, 1, 4, false)).unwrap();
    assert_eq!(service.slots(), 1);

    let err = service.request_move(request("s1", 1)).unwrap_err();
    assert!(matches!(err, AnalysisError::EngineFailure(_)));

    // the slot restarted its engine and keeps serving
    assert_eq!(service.slots(), 1);
    let response = service.request_move(request("s2", 1)).unwrap();
    assert_eq!(response.best_move, "e2e4");
}

#[test]
#[serial]
fn retry_once_makes_a_single_crash_transparent() {
    let (_stub, engine) = StubHarness::new("retry", "crash_once", "0");
    let service = AnalysisService::new(service_config(engine, 1, 4, true)).unwrap();

    let response = service.request_move(request("s1", 1)).unwrap();
    assert_eq!(response.best_move, "e2e4");
}

#[test]
#[serial]
fn silent_engine_is_treated_as_desynchronized() {
    let (_stub, engine) = StubHarness::new("stall", "mute", "0");
    let mut cfg = service_config(engine, 1, 4, false);
    cfg.limits.stall_timeout_ms = 400;
    let service = AnalysisService::new(cfg).unwrap();

    let err = service.request_move(request("s1", 1)).unwrap_err();
    assert!(matches!(err, AnalysisError::EngineFailure(_)));
}

#[test]
#[serial]
fn request_timeout_reconciles_the_session() {
    let (_stub, engine) = StubHarness::new("timeout", "waitstop", "0");
    let mut cfg = service_config(engine, 1, 4, false);
    cfg.limits.request_timeout_ms = 500;
    let service = AnalysisService::new(cfg).unwrap();

    let err = service.request_move(request("s1", 1)).unwrap_err();
    assert!(matches!(err, AnalysisError::Timeout));

    // the cancellation path released the engine and freed the id
    std::thread::sleep(Duration::from_millis(300));
    let err = service.request_move(request("s1", 1)).unwrap_err();
    assert!(matches!(err, AnalysisError::Timeout));
}

#[test]
#[serial]
fn engine_target_options_reach_the_engine_at_a_safe_point() {
    let (stub, engine) = StubHarness::new("options", "normal", "0");
    let service = AnalysisService::new(service_config(engine, 1, 4, false)).unwrap();

    service
        .apply_option(OptionUpdate {
            id: "engine".to_string(),
            name: "Skill Level".to_string(),
            value: "5".to_string(),
        })
        .unwrap();
    service
        .apply_option(OptionUpdate {
            id: "engine-0".to_string(),
            name: "Bogus Option".to_string(),
            value: "1".to_string(),
        })
        .unwrap();
    std::thread::sleep(Duration::from_millis(400));

    service.request_move(request("s1", 1)).unwrap();
    drop(service);

    let transcript = stub.transcript();
    assert!(transcript.contains("setoption name Skill Level value 5"));
    // undeclared options are skipped rather than forwarded
    assert!(!transcript.contains("Bogus Option"));
}

#[test]
#[serial]
fn unknown_option_targets_are_rejected() {
    let (_stub, engine) = StubHarness::new("badtarget", "normal", "0");
    let service = AnalysisService::new(service_config(engine, 1, 4, false)).unwrap();

    let err = service
        .apply_option(OptionUpdate {
            id: "no-such-session".to_string(),
            name: "Skill Level".to_string(),
            value: "5".to_string(),
        })
        .unwrap_err();
    assert!(matches!(err, AnalysisError::UnknownTarget(_)));

    let err = service
        .apply_option(OptionUpdate {
            id: "engine-9".to_string(),
            name: "Skill Level".to_string(),
            value: "5".to_string(),
        })
        .unwrap_err();
    assert!(matches!(err, AnalysisError::UnknownTarget(_)));
}

#[test]
#[serial]
fn best_move_leads_variations_despite_abandoned_mate_line() {
    let (_stub, engine) = StubHarness::new("stale-pin", "abandoned", "0");
    let service = AnalysisService::new(service_config(engine, 1, 4, false)).unwrap();

    // A mate briefly reported on index 2 that the engine never refreshed
    // would outrank the final first PV by raw strength; the response must
    // still lead with the engine's definitive choice.
    let response = service.request_move(request("s1", 2)).unwrap();
    assert_eq!(response.best_move, "e2e4");
    assert_eq!(response.best_move, response.variations[0].moves[0]);
    assert_eq!(response.variations[0].score, 100);
    assert_eq!(response.variations[1].mate, 3);
}

#[test]
#[serial]
fn dropping_the_stream_stops_the_search() {
    let (stub, engine) = StubHarness::new("dropstream", "chatty", "0");
    let service = AnalysisService::new(service_config(engine, 1, 4, false)).unwrap();

    let updates = service.request_move_streaming(request("s1", 1)).unwrap();
    let first = updates.iter().next();
    assert!(matches!(first, Some(SessionUpdate::Variations(_))));
    drop(updates);

    // The next info line hits the closed stream, which must stop the
    // engine and reconcile the session instead of searching to the limit.
    std::thread::sleep(Duration::from_millis(2500));
    assert!(stub.count_lines_starting_with("stop") >= 1);
    let response = service.request_move(request("s1", 1)).unwrap();
    assert_eq!(response.id, "s1");
}

#[test]
#[serial]
fn post_handshake_readiness_timeout_is_not_a_start_failure() {
    let (_stub, mut engine_cfg) = StubHarness::new("deaf", "deaf", "0");
    engine_cfg.ready_timeout_ms = 400;

    // The handshake's own isready is answered, so spawn succeeds.
    let mut engine = EngineProcess::spawn(&engine_cfg, "engine-0").unwrap();
    let err = engine.sync_ready().unwrap_err();
    assert!(matches!(err, AnalysisError::Timeout));
}

#[test]
#[serial]
fn streaming_delivers_refinements_then_terminal() {
    let (_stub, engine) = StubHarness::new("stream", "multipv", "0");
    let service = AnalysisService::new(service_config(engine, 1, 4, false)).unwrap();

    let updates = service.request_move_streaming(request("s1", 2)).unwrap();
    let mut variation_batches = Vec::new();
    let mut terminal = None;
    for update in updates.iter() {
        match update {
            SessionUpdate::Variations(vars) => variation_batches.push(vars),
            other => {
                terminal = Some(other);
                break;
            }
        }
    }

    assert!(!variation_batches.is_empty());
    let last = variation_batches.last().unwrap();
    assert_eq!(last[0].score, 64);
    let Some(SessionUpdate::Completed(response)) = terminal else {
        panic!("expected a completed terminal update");
    };
    assert_eq!(response.best_move, "e2e4");
    assert_eq!(response.variations.len(), 2);
}

#[test]
#[serial]
fn validation_failures_never_spawn_engine_traffic() {
    let (stub, engine) = StubHarness::new("validation", "normal", "0");
    let service = AnalysisService::new(service_config(engine, 1, 4, false)).unwrap();

    let mut bad = request("s1", 0);
    assert!(matches!(
        service.request_move(bad.clone()).unwrap_err(),
        AnalysisError::Validation(_)
    ));
    bad = request("", 1);
    assert!(matches!(
        service.request_move(bad).unwrap_err(),
        AnalysisError::Validation(_)
    ));

    drop(service);
    assert_eq!(stub.count_lines_starting_with("position"), 0);
    assert_eq!(stub.count_lines_starting_with("go"), 0);
}

fn _assert_send_sync<T: Send + Sync>() {}

#[test]
fn service_is_shareable_across_threads() {
    _assert_send_sync::<AnalysisService>();
    _assert_send_sync::<Arc<AnalysisService>>();
}

// Keep the harness path helper honest about uniqueness across tests.
#[test]
fn harness_dirs_are_distinct_per_test() {
    let (a, _) = StubHarness::new("uniq-a", "normal", "0");
    let (b, _) = StubHarness::new("uniq-b", "normal", "0");
    assert_ne!(a.dir, b.dir);
    assert!(Path::new(&a.dir).exists());
}
