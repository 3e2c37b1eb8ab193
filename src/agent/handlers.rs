//! Built-in capability handlers
//!
//! Wires the GUI-automation core, process listing, log queries, and the
//! health probe into the dispatcher under their concurrency classes. Every
//! handler validates its parameters, returns envelope values, and never
//! panics past the dispatcher boundary.

use std::sync::{Arc, Weak};

use serde::Deserialize;
use serde_json::{json, Value};
use sysinfo::System;
use tokio::sync::mpsc;

use crate::agent::dispatcher::{
    ConcurrencyClass, Dispatcher, FnHandler, HandlerError, HandlerOptions, HandlerOutput,
};
use crate::agent::health::HealthMonitor;
use crate::agent::log_buffer::{LogLevel, LogManager, LogQuery};
use crate::domain_types::{CommandName, CommandTimeoutSecs, MaxTreeDepth};
use crate::gui::backend::{AccessibilityTree, Chord, InputSynthesizer, Rect};
use crate::gui::capture::CaptureService;
use crate::gui::input::{SendTextEngine, TextTarget};
use crate::gui::launch::{execute_program, LaunchRequest};
use crate::gui::ocr::OcrService;
use crate::gui::position_memory::PositionMemory;
use crate::gui::uia::build_tree;
use crate::gui::windows::{AppPredicate, WindowManager};

/// Capability gating the desktop-mutating handlers
pub const CONTROL_CAPABILITY: &str = "control";

/// A restart requested over the wire, consumed by the agent runtime
#[derive(Debug, Clone, PartialEq)]
pub struct RestartRequest {
    pub delay_secs: u64,
    pub reason: String,
}

/// Services the built-in handlers close over
pub struct HandlerContext {
    pub windows: Arc<WindowManager>,
    pub tree: Arc<dyn AccessibilityTree>,
    pub input: Arc<dyn InputSynthesizer>,
    pub engine: Arc<SendTextEngine>,
    pub capture: Arc<CaptureService>,
    pub ocr: Option<Arc<OcrService>>,
    pub memory: Arc<PositionMemory>,
    pub logs: Arc<LogManager>,
    pub health: Arc<HealthMonitor>,
    pub restart: mpsc::Sender<RestartRequest>,
}

fn cmd(name: &str) -> CommandName {
    CommandName::try_new(name).expect("builtin command names are valid")
}

fn parse<T: for<'de> Deserialize<'de>>(params: Value) -> Result<T, HandlerError> {
    serde_json::from_value(params).map_err(|e| HandlerError::invalid_param(e.to_string()))
}

fn gui_options() -> HandlerOptions {
    HandlerOptions {
        required_capability: Some(CONTROL_CAPABILITY.to_string()),
        concurrency_class: Some(ConcurrencyClass::GuiExclusive),
        default_timeout: None,
    }
}

fn blocking_options(timeout_secs: u64) -> HandlerOptions {
    HandlerOptions {
        required_capability: Some(CONTROL_CAPABILITY.to_string()),
        concurrency_class: Some(ConcurrencyClass::Blocking),
        default_timeout: CommandTimeoutSecs::try_new(timeout_secs).ok(),
    }
}

/// Registers every built-in handler on the dispatcher
///
/// `dispatcher_ref` is a weak back-reference used only by the introspection
/// handler; the dispatcher owns the handlers, never the other way round.
pub fn register_builtin_handlers(
    dispatcher: &Dispatcher,
    dispatcher_ref: Weak<Dispatcher>,
    ctx: Arc<HandlerContext>,
) {
    register_ping(dispatcher);
    register_window_handlers(dispatcher, &ctx);
    register_uia_handler(dispatcher, &ctx);
    register_input_handlers(dispatcher, &ctx);
    register_capture_handlers(dispatcher, &ctx);
    register_process_handler(dispatcher);
    register_launch_handler(dispatcher);
    register_log_handlers(dispatcher, &ctx);
    register_info_handler(dispatcher, dispatcher_ref, &ctx);
    register_restart_handler(dispatcher, &ctx);
}

fn register_ping(dispatcher: &Dispatcher) {
    dispatcher.register(
        cmd("ping"),
        Arc::new(FnHandler(|_params| async {
            Ok(HandlerOutput::data(json!({"pong": true})))
        })),
        HandlerOptions::default(),
    );
}

fn register_window_handlers(dispatcher: &Dispatcher, ctx: &Arc<HandlerContext>) {
    let windows = Arc::clone(&ctx.windows);
    dispatcher.register(
        cmd("get_windows"),
        Arc::new(FnHandler(move |_params| {
            let windows = Arc::clone(&windows);
            async move {
                let records = tokio::task::spawn_blocking(move || windows.get_windows())
                    .await
                    .map_err(internal)??;
                Ok(HandlerOutput::data(json!({
                    "count": records.len(),
                    "windows": records,
                })))
            }
        })),
        HandlerOptions::default(),
    );

    #[derive(Deserialize)]
    struct FindParams {
        #[serde(default)]
        app: Option<AppPredicate>,
    }
    let windows = Arc::clone(&ctx.windows);
    dispatcher.register(
        cmd("find_cursor_windows"),
        Arc::new(FnHandler(move |params| {
            let windows = Arc::clone(&windows);
            async move {
                let params: FindParams = parse(params)?;
                let predicate = params.app.unwrap_or_else(AppPredicate::cursor);
                let report =
                    tokio::task::spawn_blocking(move || windows.find_app_windows(&predicate))
                        .await
                        .map_err(internal)??;
                Ok(HandlerOutput::data(serde_json::to_value(report).map_err(internal)?))
            }
        })),
        HandlerOptions::default(),
    );

    #[derive(Deserialize)]
    struct ActivateParams {
        hwnd: u64,
    }
    let windows = Arc::clone(&ctx.windows);
    dispatcher.register(
        cmd("activate_window"),
        Arc::new(FnHandler(move |params| {
            let windows = Arc::clone(&windows);
            async move {
                let params: ActivateParams = parse(params)?;
                windows.activate(params.hwnd)?;
                Ok(HandlerOutput::data(json!({"activated": params.hwnd})))
            }
        })),
        gui_options(),
    );
}

fn register_uia_handler(dispatcher: &Dispatcher, ctx: &Arc<HandlerContext>) {
    #[derive(Deserialize)]
    struct UiaParams {
        hwnd: u64,
        #[serde(default)]
        max_depth: Option<usize>,
    }
    let tree = Arc::clone(&ctx.tree);
    dispatcher.register(
        cmd("get_window_uia_structure"),
        Arc::new(FnHandler(move |params| {
            let tree = Arc::clone(&tree);
            async move {
                let params: UiaParams = parse(params)?;
                let depth = match params.max_depth {
                    None => MaxTreeDepth::default(),
                    Some(depth) => MaxTreeDepth::try_new(depth).map_err(|e| {
                        HandlerError::invalid_param(format!("max_depth: {e}"))
                    })?,
                };
                let raw = tokio::task::spawn_blocking(move || {
                    tree.walk(params.hwnd, depth.as_usize())
                })
                .await
                .map_err(internal)??;
                let structure = build_tree(&raw, depth.as_usize());
                Ok(HandlerOutput::data(json!({
                    "hwnd": params.hwnd,
                    "max_depth": depth.as_usize(),
                    "structure": structure,
                })))
            }
        })),
        gui_options(),
    );
}

fn register_input_handlers(dispatcher: &Dispatcher, ctx: &Arc<HandlerContext>) {
    #[derive(Deserialize)]
    struct SendTextParams {
        target: TextTarget,
        text: String,
    }
    let engine = Arc::clone(&ctx.engine);
    dispatcher.register(
        cmd("send_text"),
        Arc::new(FnHandler(move |params| {
            let engine = Arc::clone(&engine);
            async move {
                let params: SendTextParams = parse(params)?;
                let outcome = engine.send_text(&params.target, &params.text).await?;
                if outcome.success {
                    let method = outcome.method.map(|m| m.as_str().to_string());
                    let mut output =
                        HandlerOutput::data(serde_json::to_value(&outcome).map_err(internal)?);
                    if let Some(method) = method {
                        output = output.with_method(method);
                    }
                    Ok(output)
                } else {
                    Err(HandlerError::new(
                        crate::protocol::ErrorCode::InputNotApplied,
                        "InputNotApplied",
                        "text was not applied by either write path",
                    )
                    .with_details(serde_json::to_value(&outcome).map_err(internal)?))
                }
            }
        })),
        gui_options(),
    );

    #[derive(Deserialize)]
    struct SendKeysParams {
        #[serde(default)]
        chords: Vec<Chord>,
        #[serde(default)]
        text: Option<String>,
    }
    let input = Arc::clone(&ctx.input);
    dispatcher.register(
        cmd("send_keys"),
        Arc::new(FnHandler(move |params| {
            let input = Arc::clone(&input);
            async move {
                let params: SendKeysParams = parse(params)?;
                if params.chords.is_empty() && params.text.is_none() {
                    return Err(HandlerError::invalid_param(
                        "send_keys requires chords or text",
                    ));
                }
                let sent_chords = params.chords.len();
                tokio::task::spawn_blocking(move || -> Result<(), crate::error::GuiError> {
                    if let Some(text) = &params.text {
                        input.type_text(text, std::time::Duration::from_millis(30), true)?;
                    }
                    for chord in &params.chords {
                        input.key_chord(*chord)?;
                    }
                    Ok(())
                })
                .await
                .map_err(internal)??;
                Ok(HandlerOutput::data(json!({"sent_chords": sent_chords})))
            }
        })),
        gui_options(),
    );

    let engine = Arc::clone(&ctx.engine);
    dispatcher.register(
        cmd("submit"),
        Arc::new(FnHandler(move |_params| {
            let engine = Arc::clone(&engine);
            async move {
                engine.submit()?;
                Ok(HandlerOutput::data(json!({"submitted": true})))
            }
        })),
        gui_options(),
    );

    #[derive(Deserialize)]
    struct FocusedParams {
        hwnd: u64,
    }
    let engine = Arc::clone(&ctx.engine);
    dispatcher.register(
        cmd("get_focused_value"),
        Arc::new(FnHandler(move |params| {
            let engine = Arc::clone(&engine);
            async move {
                let params: FocusedParams = parse(params)?;
                let value = engine.read_focused_value(params.hwnd)?;
                Ok(HandlerOutput::data(json!({"value": value})))
            }
        })),
        gui_options(),
    );
}

fn register_capture_handlers(dispatcher: &Dispatcher, ctx: &Arc<HandlerContext>) {
    #[derive(Deserialize)]
    struct ScreenshotParams {
        #[serde(default)]
        hwnd: Option<u64>,
    }
    let capture = Arc::clone(&ctx.capture);
    dispatcher.register(
        cmd("screenshot"),
        Arc::new(FnHandler(move |params| {
            let capture = Arc::clone(&capture);
            async move {
                let params: ScreenshotParams = parse(params)?;
                let payload =
                    tokio::task::spawn_blocking(move || capture.screenshot(params.hwnd))
                        .await
                        .map_err(internal)??;
                Ok(HandlerOutput::data(serde_json::to_value(payload).map_err(internal)?))
            }
        })),
        blocking_options(60),
    );

    #[derive(Deserialize)]
    struct OcrParams {
        x: i32,
        y: i32,
        w: i32,
        h: i32,
    }
    let capture = Arc::clone(&ctx.capture);
    let ocr = ctx.ocr.clone();
    dispatcher.register(
        cmd("ocr_region"),
        Arc::new(FnHandler(move |params| {
            let capture = Arc::clone(&capture);
            let ocr = ocr.clone();
            async move {
                let params: OcrParams = parse(params)?;
                if params.w <= 0 || params.h <= 0 {
                    return Err(HandlerError::invalid_param("region must be positive"));
                }
                let Some(ocr) = ocr else {
                    return Err(HandlerError::new(
                        crate::protocol::ErrorCode::OsError,
                        "OcrUnavailable",
                        "no OCR engine configured",
                    ));
                };
                let region = Rect::new(
                    params.x,
                    params.y,
                    params.x + params.w,
                    params.y + params.h,
                );
                let spans = tokio::task::spawn_blocking(move || {
                    let png = capture.region_png(region)?;
                    ocr.detect_text(&png)
                })
                .await
                .map_err(internal)??;
                Ok(HandlerOutput::data(json!({
                    "count": spans.len(),
                    "spans": spans,
                })))
            }
        })),
        blocking_options(60),
    );
}

fn register_process_handler(dispatcher: &Dispatcher) {
    #[derive(Deserialize)]
    struct ProcessParams {
        #[serde(default = "default_process_limit")]
        limit: usize,
    }
    fn default_process_limit() -> usize {
        50
    }
    dispatcher.register(
        cmd("get_processes"),
        Arc::new(FnHandler(move |params| async move {
            let params: ProcessParams = parse(params)?;
            let processes = tokio::task::spawn_blocking(move || {
                let mut system = System::new();
                system.refresh_processes();
                let mut rows: Vec<Value> = system
                    .processes()
                    .iter()
                    .map(|(pid, process)| {
                        json!({
                            "pid": pid.as_u32(),
                            "name": process.name(),
                            "memory_mb": process.memory() / (1024 * 1024),
                        })
                    })
                    .collect();
                rows.sort_by_key(|row| {
                    std::cmp::Reverse(row["memory_mb"].as_u64().unwrap_or(0))
                });
                rows.truncate(params.limit);
                rows
            })
            .await
            .map_err(internal)?;
            Ok(HandlerOutput::data(json!({
                "count": processes.len(),
                "processes": processes,
            })))
        })),
        HandlerOptions::default(),
    );
}

fn register_launch_handler(dispatcher: &Dispatcher) {
    dispatcher.register(
        cmd("execute_program"),
        Arc::new(FnHandler(move |params| async move {
            let request: LaunchRequest = parse(params)?;
            let result = execute_program(&request).await?;
            Ok(HandlerOutput::data(serde_json::to_value(result).map_err(internal)?))
        })),
        blocking_options(120),
    );
}

fn register_log_handlers(dispatcher: &Dispatcher, ctx: &Arc<HandlerContext>) {
    let logs = Arc::clone(&ctx.logs);
    dispatcher.register(
        cmd("query_logs"),
        Arc::new(FnHandler(move |params| {
            let logs = Arc::clone(&logs);
            async move {
                let query: LogQuery = parse(params)?;
                let records = logs.query(&query);
                Ok(HandlerOutput::data(json!({
                    "count": records.len(),
                    "records": records,
                })))
            }
        })),
        HandlerOptions::default(),
    );

    #[derive(Deserialize)]
    struct LevelParams {
        #[serde(default)]
        logger: Option<String>,
        level: LogLevel,
    }
    let logs = Arc::clone(&ctx.logs);
    dispatcher.register(
        cmd("set_log_level"),
        Arc::new(FnHandler(move |params| {
            let logs = Arc::clone(&logs);
            async move {
                let params: LevelParams = parse(params)?;
                match params.logger {
                    Some(logger) => logs.set_logger_level(logger, params.level),
                    None => logs.set_default_level(params.level),
                }
                Ok(HandlerOutput::data(json!({"applied": true})))
            }
        })),
        HandlerOptions::default(),
    );
}

fn register_info_handler(
    dispatcher: &Dispatcher,
    dispatcher_ref: Weak<Dispatcher>,
    ctx: &Arc<HandlerContext>,
) {
    let health = Arc::clone(&ctx.health);
    let logs = Arc::clone(&ctx.logs);
    let memory = Arc::clone(&ctx.memory);
    dispatcher.register(
        cmd("get_client_info"),
        Arc::new(FnHandler(move |_params| {
            let health = Arc::clone(&health);
            let logs = Arc::clone(&logs);
            let memory = Arc::clone(&memory);
            let dispatcher_ref = dispatcher_ref.clone();
            async move {
                let handlers = dispatcher_ref
                    .upgrade()
                    .map(|d| d.list())
                    .unwrap_or_default();
                let (buffered, dropped) = logs.stats();
                Ok(HandlerOutput::data(json!({
                    "health": health.report(),
                    "handlers": handlers,
                    "log_buffer": {"buffered": buffered, "dropped": dropped},
                    "position_memory_entries": memory.len(),
                })))
            }
        })),
        HandlerOptions::default(),
    );
}

fn register_restart_handler(dispatcher: &Dispatcher, ctx: &Arc<HandlerContext>) {
    #[derive(Deserialize)]
    struct RestartParams {
        #[serde(default = "default_restart_delay")]
        delay_secs: u64,
        #[serde(default = "default_restart_reason")]
        reason: String,
    }
    fn default_restart_delay() -> u64 {
        1
    }
    fn default_restart_reason() -> String {
        "operator request".to_string()
    }
    let restart = ctx.restart.clone();
    dispatcher.register(
        cmd("restart_client"),
        Arc::new(FnHandler(move |params| {
            let restart = restart.clone();
            async move {
                let params: RestartParams = parse(params)?;
                restart
                    .send(RestartRequest {
                        delay_secs: params.delay_secs,
                        reason: params.reason.clone(),
                    })
                    .await
                    .map_err(|_| {
                        HandlerError::new(
                            crate::protocol::ErrorCode::Internal,
                            "RestartUnavailable",
                            "agent runtime is not accepting restart requests",
                        )
                    })?;
                Ok(HandlerOutput::data(json!({
                    "restarting_in_secs": params.delay_secs,
                    "reason": params.reason,
                })))
            }
        })),
        HandlerOptions {
            required_capability: Some("hot_reload".to_string()),
            ..HandlerOptions::default()
        },
    );
}

fn internal(e: impl std::fmt::Display) -> HandlerError {
    HandlerError::new(crate::protocol::ErrorCode::Internal, "Internal", e.to_string())
}

/// Returns the built-in command handler for an alias target, if registered
#[must_use]
pub fn is_builtin(name: &str) -> bool {
    matches!(
        name,
        "ping"
            | "get_windows"
            | "find_cursor_windows"
            | "activate_window"
            | "get_window_uia_structure"
            | "send_text"
            | "send_keys"
            | "submit"
            | "get_focused_value"
            | "screenshot"
            | "ocr_region"
            | "get_processes"
            | "execute_program"
            | "query_logs"
            | "set_log_level"
            | "get_client_info"
            | "restart_client"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::dispatcher::Dispatcher;
    use crate::domain_types::{
        HealthSampleSecs, HealthWindowSamples, LogBufferCapacity, PositionMemoryCap,
        StaleFailureLimit,
    };
    use crate::gui::backend::{PlacementState, RawUiaNode, SimulatedDesktop, WindowRecord};
    use crate::gui::input::SendTextConfig;
    use crate::protocol::{CapabilitySet, ErrorCode};
    use crate::time_provider::MockTimeProvider;

    fn capabilities() -> CapabilitySet {
        let mut caps = CapabilitySet::new();
        caps.insert("control".to_string(), true);
        caps.insert("hot_reload".to_string(), true);
        caps
    }

    struct Fixture {
        desktop: Arc<SimulatedDesktop>,
        dispatcher: Arc<Dispatcher>,
        restart_rx: mpsc::Receiver<RestartRequest>,
    }

    fn fixture() -> Fixture {
        let desktop = Arc::new(SimulatedDesktop::new());
        desktop.set_windows(vec![WindowRecord {
            hwnd: 7,
            title: "main.rs - Cursor".to_string(),
            class_name: "Chrome_WidgetWin_1".to_string(),
            process_id: 100,
            process_name: "Cursor.exe".to_string(),
            rect: crate::gui::backend::Rect::new(0, 0, 1200, 900),
            visible: true,
            enabled: true,
            placement_state: PlacementState::Normal,
        }]);
        let mut tree = RawUiaNode {
            control_type: "Window".to_string(),
            name: "Cursor".to_string(),
            is_enabled: true,
            is_visible: true,
            rect: crate::gui::backend::Rect::new(0, 0, 1200, 900),
            ..RawUiaNode::default()
        };
        tree.children.push(RawUiaNode {
            control_type: "Edit".to_string(),
            name: "Chat Input".to_string(),
            automation_id: "chat-box".to_string(),
            rect: crate::gui::backend::Rect::new(350, 820, 850, 860),
            is_enabled: true,
            is_visible: true,
            is_keyboard_focusable: true,
            ..RawUiaNode::default()
        });
        desktop.set_tree(7, tree);

        let windows = Arc::new(WindowManager::new(desktop.clone()));
        let memory = Arc::new(PositionMemory::new(
            PositionMemoryCap::default(),
            StaleFailureLimit::default(),
        ));
        let engine = Arc::new(SendTextEngine::new(
            Arc::clone(&windows),
            desktop.clone(),
            desktop.clone(),
            desktop.clone(),
            Arc::clone(&memory),
            Arc::new(MockTimeProvider::new()),
            SendTextConfig::default(),
        ));
        let capture = Arc::new(CaptureService::new(desktop.clone(), Arc::clone(&windows)));
        let logs = Arc::new(LogManager::new(LogBufferCapacity::default()));
        let health = Arc::new(HealthMonitor::new(
            HealthSampleSecs::default(),
            HealthWindowSamples::default(),
        ));
        let (restart_tx, restart_rx) = mpsc::channel(4);

        let ctx = Arc::new(HandlerContext {
            windows,
            tree: desktop.clone(),
            input: desktop.clone(),
            engine,
            capture,
            ocr: None,
            memory,
            logs,
            health,
            restart: restart_tx,
        });
        let dispatcher = Arc::new(Dispatcher::new(capabilities()));
        register_builtin_handlers(&dispatcher, Arc::downgrade(&dispatcher), ctx);
        Fixture {
            desktop,
            dispatcher,
            restart_rx,
        }
    }

    fn name(n: &str) -> CommandName {
        CommandName::try_new(n).unwrap()
    }

    #[tokio::test]
    async fn get_windows_returns_records() {
        let fx = fixture();
        let envelope = fx
            .dispatcher
            .dispatch(&name("get_windows"), None, None, None)
            .await;
        assert!(envelope.success, "{:?}", envelope.error);
        let data = envelope.data.unwrap();
        assert_eq!(data["count"], 1);
        assert_eq!(data["windows"][0]["hwnd"], 7);
    }

    #[tokio::test]
    async fn uia_structure_honours_depth_and_validates_params() {
        let fx = fixture();
        let envelope = fx
            .dispatcher
            .dispatch(
                &name("get_window_uia_structure"),
                Some(json!({"hwnd": 7, "max_depth": 0})),
                None,
                None,
            )
            .await;
        assert!(envelope.success);
        let data = envelope.data.unwrap();
        assert_eq!(data["structure"]["error"], "max depth reached");

        let invalid = fx
            .dispatcher
            .dispatch(
                &name("get_window_uia_structure"),
                Some(json!({"hwnd": 7, "max_depth": 500})),
                None,
                None,
            )
            .await;
        assert_eq!(
            invalid.error.unwrap().code,
            Some(ErrorCode::InvalidParam)
        );
    }

    #[tokio::test]
    async fn send_text_reports_method_in_metadata() {
        let fx = fixture();
        let envelope = fx
            .dispatcher
            .dispatch(
                &name("send_text"),
                Some(json!({
                    "target": {"kind": "intent", "hwnd": 7},
                    "text": "hello world",
                })),
                Some("c9".to_string()),
                None,
            )
            .await;
        assert!(envelope.success, "{:?}", envelope.error);
        let metadata = envelope.metadata.unwrap();
        assert_eq!(metadata.method.as_deref(), Some("keystroke"));
        assert_eq!(fx.desktop.focused_value(), "hello world");
    }

    #[tokio::test]
    async fn blocked_keystrokes_report_the_clipboard_method() {
        let fx = fixture();
        fx.desktop.block_keystrokes(true);
        let envelope = fx
            .dispatcher
            .dispatch(
                &name("send_text"),
                Some(json!({
                    "target": {"kind": "intent", "hwnd": 7},
                    "text": "hello world",
                })),
                None,
                None,
            )
            .await;
        assert!(envelope.success, "{:?}", envelope.error);
        let metadata = envelope.metadata.unwrap();
        assert_eq!(metadata.method.as_deref(), Some("clipboard"));
        assert_eq!(fx.desktop.focused_value(), "hello world");
    }

    #[tokio::test]
    async fn send_text_failure_surfaces_input_not_applied() {
        let fx = fixture();
        fx.desktop.block_keystrokes(true);
        fx.desktop.block_paste(true);
        let envelope = fx
            .dispatcher
            .dispatch(
                &name("send_text"),
                Some(json!({
                    "target": {"kind": "intent", "hwnd": 7},
                    "text": "never lands",
                })),
                None,
                None,
            )
            .await;
        assert!(!envelope.success);
        let error = envelope.error.unwrap();
        assert_eq!(error.code, Some(ErrorCode::InputNotApplied));
        let details = error.details.unwrap();
        assert_eq!(details["keystroke_validated"], false);
        assert_eq!(details["clipboard_validated"], false);
    }

    #[tokio::test]
    async fn screenshot_returns_base64_payload() {
        let fx = fixture();
        let envelope = fx
            .dispatcher
            .dispatch(&name("screenshot"), Some(json!({"hwnd": 7})), None, None)
            .await;
        assert!(envelope.success);
        let data = envelope.data.unwrap();
        assert_eq!(data["format"], "png");
        assert_eq!(data["width"], 1200);
    }

    #[tokio::test]
    async fn ocr_without_engines_is_a_clean_failure() {
        let fx = fixture();
        let envelope = fx
            .dispatcher
            .dispatch(
                &name("ocr_region"),
                Some(json!({"x": 0, "y": 0, "w": 100, "h": 100})),
                None,
                None,
            )
            .await;
        assert!(!envelope.success);
        assert!(envelope.validate().is_ok());
    }

    #[tokio::test]
    async fn get_processes_lists_this_process() {
        let fx = fixture();
        let envelope = fx
            .dispatcher
            .dispatch(&name("get_processes"), Some(json!({"limit": 500})), None, None)
            .await;
        assert!(envelope.success);
        assert!(envelope.data.unwrap()["count"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn client_info_reports_registered_handlers() {
        let fx = fixture();
        let envelope = fx
            .dispatcher
            .dispatch(&name("get_client_info"), None, None, None)
            .await;
        assert!(envelope.success);
        let data = envelope.data.unwrap();
        let handlers = data["handlers"].as_array().unwrap();
        assert!(handlers.iter().any(|h| h["name"] == "send_text"));
        assert_eq!(data["health"]["state"], "ok");
    }

    #[tokio::test]
    async fn restart_command_signals_the_runtime() {
        let mut fx = fixture();
        let envelope = fx
            .dispatcher
            .dispatch(
                &name("restart_client"),
                Some(json!({"delay_secs": 2, "reason": "plugin update"})),
                None,
                None,
            )
            .await;
        assert!(envelope.success);
        let request = fx.restart_rx.recv().await.unwrap();
        assert_eq!(request.delay_secs, 2);
        assert_eq!(request.reason, "plugin update");
    }

    #[tokio::test]
    async fn query_logs_round_trips() {
        let fx = fixture();
        fx.dispatcher
            .dispatch(
                &name("set_log_level"),
                Some(json!({"level": "info"})),
                None,
                None,
            )
            .await;
        let envelope = fx
            .dispatcher
            .dispatch(&name("query_logs"), Some(json!({"tail": 10})), None, None)
            .await;
        assert!(envelope.success);
    }
}
