//! End-to-end: config file to polled registry, against an in-process
//! register gateway.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use pretty_assertions::assert_eq;
use serial_test::serial;

use meterd::app::Application;
use meterd::config::Config;

async fn spawn_gateway(requests: Arc<AtomicUsize>) -> String {
    let router = Router::new().route(
        "/readholdingregisters",
        get(move || {
            let requests = requests.clone();
            async move {
                // first read answers 100, every later one 150
                let hex = if requests.fetch_add(1, Ordering::SeqCst) == 0 {
                    "00000064"
                } else {
                    "00000096"
                };
                format!(r#"{{"Data":{{"Address":4,"Quantity":2,"Data":"{hex}"}}}}"#)
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn write_config(dir: &tempfile::TempDir, base_url: &str) -> std::path::PathBuf {
    let yaml = format!(
        r#"
time_period: 5
meter:
  house:
    type: mbgateway
    connection: "{base_url} timeout:1000 maxretries:0"
    measurand:
      "energy (wh)": "address:4 format:uint32 sf:0"
    mqtt_topic: "$(METERD_IT_TOPIC)"
measurand:
  "energy (wh)":
    energy: "out:influx type:value unit:Wh"
    consumption: "out:influx type:delta exclude:0"
"#
    );
    let path = dir.path().join("meterd.yaml");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(yaml.as_bytes()).unwrap();
    path
}

#[tokio::test]
#[serial]
async fn polls_meters_and_derives_deltas_across_cycles() {
    let requests = Arc::new(AtomicUsize::new(0));
    let base = spawn_gateway(requests.clone()).await;

    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, &base);

    std::env::set_var("METERD_IT_TOPIC", "home/meter/house");
    let cfg = Config::load(&path).unwrap();
    std::env::remove_var("METERD_IT_TOPIC");

    assert_eq!(
        cfg.meter["house"].mqtt_topic.as_deref(),
        Some("home/meter/house")
    );

    let app = Application::build(cfg).unwrap();

    app.meters.poll_cycle(app.routing.clone()).await;
    let s = app.meters.snapshot().meters["house"].measurands["energy (wh)"];
    assert_eq!(s.value, 100.0);
    assert_eq!(s.delta, 0.0, "first sample has no baseline");

    // make sure the wall clock advances between the two cycles
    tokio::time::sleep(Duration::from_millis(20)).await;

    app.meters.poll_cycle(app.routing.clone()).await;
    let s = app.meters.snapshot().meters["house"].measurands["energy (wh)"];
    assert_eq!(s.value, 150.0);
    assert_eq!(s.last_value, 100.0);
    assert_eq!(s.delta, 50.0);
    assert!(s.avg > 0.0);

    assert_eq!(requests.load(Ordering::SeqCst), 2);
}

#[tokio::test]
#[serial]
async fn config_without_meters_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.yaml");
    std::fs::write(&path, "time_period: 5\n").unwrap();

    let err = Config::load(&path).unwrap_err();
    assert!(err.to_string().contains("at least one meter"));
}
