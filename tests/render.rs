//! End-to-end renders against a real interpreter.
//!
//! Every test returns early when `python3` with matplotlib and numpy is not
//! installed.

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use plotrun::emitter::PNG_SIGNATURE;
use plotrun::{
    build_router, AppState, ExecError, ExecutionOptions, NativePythonEngine, PythonEngine,
    ResourceLimits, ServiceConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn plotting_python() -> Option<PathBuf> {
    let python = which::which("python3").ok()?;
    let status = std::process::Command::new(&python)
        .args(["-c", "import matplotlib, numpy"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .ok()?;
    status.success().then_some(python)
}

fn engine(python: PathBuf, workspaces: &Path) -> NativePythonEngine {
    NativePythonEngine::with_python_path(python)
        .unwrap()
        .with_workspace_base(workspaces.to_path_buf())
}

fn png_width(png: &[u8]) -> u32 {
    u32::from_be_bytes([png[16], png[17], png[18], png[19]])
}

fn submit(code: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/execute-code")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::json!({ "code": code }).to_string()))
        .unwrap()
}

fn router(python: PathBuf, dir: &Path) -> axum::Router {
    let config = ServiceConfig {
        picture_dir: dir.join("picture"),
        log_file: dir.join("api.log"),
        ..Default::default()
    };
    let engine = engine(python, &dir.join("workspaces"));
    build_router(AppState::new(config, Arc::new(engine)))
}

#[tokio::test]
async fn test_plot_is_returned_and_saved() {
    let Some(python) = plotting_python() else {
        eprintln!("python3 with matplotlib not available, skipping");
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let app = router(python, dir.path());

    let response = app
        .oneshot(submit(
            "import matplotlib.pyplot as plt\nplt.plot([1,2,3])\nplt.title('t')",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), 16 * 1024 * 1024).await.unwrap();
    assert!(body.starts_with(PNG_SIGNATURE));

    let saved: Vec<_> = std::fs::read_dir(dir.path().join("picture"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(saved.len(), 1);
    assert_eq!(std::fs::read(&saved[0]).unwrap(), body.to_vec());

    // workspaces are removed after each render
    assert_eq!(
        std::fs::read_dir(dir.path().join("workspaces")).unwrap().count(),
        0
    );
}

#[tokio::test]
async fn test_failures_map_to_bad_request() {
    let Some(python) = plotting_python() else {
        eprintln!("python3 with matplotlib not available, skipping");
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let app = router(python, dir.path());

    let response = app.clone().oneshot(submit("x = 1 + 1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(body["detail"].as_str().unwrap().contains("produced no image"));

    let response = app
        .oneshot(submit("plt.plot([1])\nprint(undefined_thing)"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let detail = body["detail"].as_str().unwrap();
    assert!(detail.contains("NameError: name 'undefined_thing' is not defined"));
    assert!(detail.contains("Traceback"));
}

#[tokio::test]
async fn test_concurrent_renders_do_not_share_figures() {
    let Some(python) = plotting_python() else {
        eprintln!("python3 with matplotlib not available, skipping");
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(engine(python, dir.path()));
    let options = ExecutionOptions {
        dpi: 100,
        ..Default::default()
    };

    let narrow = "plt.figure(figsize=(2, 2))\nplt.plot([1, 2])\nimport time\ntime.sleep(0.5)";
    let wide = "plt.figure(figsize=(8, 2))\nplt.plot([2, 1])\nimport time\ntime.sleep(0.5)";

    let (a, b) = tokio::join!(
        engine.execute(narrow, &options),
        engine.execute(wide, &options)
    );
    let a = a.unwrap().png.unwrap();
    let b = b.unwrap().png.unwrap();

    assert!(png_width(&a) < 300, "narrow figure width {}", png_width(&a));
    assert!(png_width(&b) > 600, "wide figure width {}", png_width(&b));
}

#[tokio::test]
async fn test_engine_behaviour() {
    let Some(python) = plotting_python() else {
        eprintln!("python3 with matplotlib not available, skipping");
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(python, dir.path());
    let options = ExecutionOptions::default();

    // captured output stays out of the image path
    let output = engine
        .execute("print('hello')\nplt.plot([1, 2])\nplt.title('布局')", &options)
        .await
        .unwrap();
    assert_eq!(output.stdout.as_deref(), Some("hello\n"));
    assert_eq!(output.figures, 1);
    assert!(!output.from_fallback);

    // saved then closed: the show-to-save file is used
    let output = engine
        .execute(
            "plt.plot([3, 1])\nplt.savefig('output.png')\nplt.close('all')",
            &options,
        )
        .await
        .unwrap();
    assert_eq!(output.figures, 0);
    assert!(output.from_fallback);
    assert!(output.png.unwrap().starts_with(PNG_SIGNATURE));

    // builtins outside the allow-list are unavailable
    match engine.execute("compile('1', 's', 'eval')", &options).await {
        Err(ExecError::RuntimeError { message, .. }) => {
            assert!(message.starts_with("NameError"), "{}", message)
        }
        other => panic!("expected NameError, got {:?}", other),
    }

    assert!(matches!(
        engine.execute("plt.plot(", &options).await,
        Err(ExecError::SyntaxError { .. })
    ));
}

#[tokio::test]
async fn test_deadline_kills_render() {
    let Some(python) = plotting_python() else {
        eprintln!("python3 with matplotlib not available, skipping");
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(python, dir.path());
    let options = ExecutionOptions {
        timeout: Duration::from_secs(2),
        ..Default::default()
    };

    let started = std::time::Instant::now();
    let result = engine
        .execute("import time\ntime.sleep(60)\nplt.plot([1])", &options)
        .await;
    assert!(matches!(result, Err(ExecError::Timeout(_))));
    // syntax check and render share one deadline
    assert!(
        started.elapsed() < options.timeout + Duration::from_secs(3),
        "took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn test_busy_loop_past_cpu_budget_is_a_timeout() {
    let Some(python) = plotting_python() else {
        eprintln!("python3 with matplotlib not available, skipping");
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(python, dir.path()).with_limits(ResourceLimits {
        cpu_seconds: 2,
        ..Default::default()
    });
    let options = ExecutionOptions {
        timeout: Duration::from_secs(10),
        ..Default::default()
    };

    let started = std::time::Instant::now();
    let result = engine.execute("while True:\n    pass", &options).await;
    match result {
        Err(ExecError::Timeout(t)) => assert_eq!(t, options.timeout),
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(20));
}
