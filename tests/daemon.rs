use chrono::{TimeZone, Utc};
use kvtiles::app::{exit_code, run_daemon, ShutdownReason, APP_HEALTH_NAME, EXIT_FATAL};
use kvtiles::error::{BootstrapError, KvtilesError, ServiceError};
use kvtiles::templates::TEMPLATE_NAMES;
use kvtiles::{KvtilesConfig, MapInfos};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tonic_health::pb::health_check_response::ServingStatus as PbServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

struct Fixture {
    config: KvtilesConfig,
    _db: TempDir,
    _static_dir: TempDir,
}

fn fixture(with_infos: bool) -> Fixture {
    let db = TempDir::new().unwrap();
    let static_dir = TempDir::new().unwrap();

    if with_infos {
        let infos = MapInfos {
            region: "france".to_string(),
            index_time: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            min_zoom: 0,
            max_zoom: 14,
            center_lat: 48.85,
            center_lng: 2.35,
        };
        std::fs::write(
            db.path().join("map_infos.json"),
            serde_json::to_vec(&infos).unwrap(),
        )
        .unwrap();

        let tile_dir = db.path().join("tiles").join("1").join("0");
        std::fs::create_dir_all(&tile_dir).unwrap();
        std::fs::write(tile_dir.join("1.pbf"), b"\x1a\x02ok").unwrap();
    }

    write_templates(static_dir.path());

    let mut config = KvtilesConfig::default();
    config.storage.db_path = db.path().to_path_buf();
    config.storage.static_dir = static_dir.path().to_path_buf();
    config.server.ip = "127.0.0.1".to_string();
    config.server.http_metrics_port = free_port();
    config.server.http_api_port = free_port();
    config.server.health_port = free_port();
    config.server.shutdown_timeout_secs = 2;

    Fixture {
        config,
        _db: db,
        _static_dir: static_dir,
    }
}

fn write_templates(dir: &Path) {
    for name in TEMPLATE_NAMES {
        std::fs::write(
            dir.join(name),
            "tiles={{.TilesBaseURL}} zoom={{.MaxZoom}} center={{.CenterLat}},{{.CenterLng}}",
        )
        .unwrap();
    }
}

async fn http_get(port: u16, path: &str) -> std::io::Result<String> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: tiles.example.com\r\nX-Forwarded-Proto: https\r\nConnection: close\r\n\r\n",
        path
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    Ok(String::from_utf8_lossy(&response).into_owned())
}

async fn wait_until_serving(port: u16) {
    for _ in 0..100 {
        if let Ok(response) = http_get(port, "/healthz").await {
            if response.starts_with("HTTP/1.1 200") {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("daemon never reported SERVING");
}

#[tokio::test]
async fn test_daemon_serves_and_shuts_down_on_signal() {
    let fixture = fixture(true);
    let server = fixture.config.server.clone();
    let (signal, interrupt) = oneshot::channel();

    let driver = async move {
        wait_until_serving(server.http_api_port).await;

        let tile = http_get(server.http_api_port, "/tiles/1/0/1").await.unwrap();
        assert!(tile.starts_with("HTTP/1.1 200"));
        assert!(tile.contains("application/x-protobuf"));

        let missing = http_get(server.http_api_port, "/tiles/1/1/1").await.unwrap();
        assert!(missing.starts_with("HTTP/1.1 404"));

        let page = http_get(server.http_api_port, "/static/index.html")
            .await
            .unwrap();
        assert!(page.contains("tiles=https://tiles.example.com zoom=14 center=48.85,2.35"));

        let metrics = http_get(server.http_metrics_port, "/metrics").await.unwrap();
        assert!(metrics.contains("kvtilesd_data_version{version=\"france 2024-03-01T12:00:00Z\"} 1"));
        assert!(metrics.contains("kvtilesd_http_requests_total"));

        let mut client = HealthClient::new(
            tonic::transport::Channel::from_shared(format!("http://127.0.0.1:{}", server.health_port))
                .unwrap()
                .connect()
                .await
                .unwrap(),
        );
        let status = client
            .check(HealthCheckRequest {
                service: APP_HEALTH_NAME.to_string(),
            })
            .await
            .unwrap()
            .into_inner()
            .status;
        assert_eq!(status, PbServingStatus::Serving as i32);

        signal
            .send(ShutdownReason::Signal("SIGTERM".to_string()))
            .unwrap();
        server
    };

    let interrupt = async move {
        interrupt
            .await
            .unwrap_or_else(|_| ShutdownReason::Signal("closed".to_string()))
    };

    let (outcome, server) = tokio::time::timeout(
        Duration::from_secs(20),
        async { tokio::join!(run_daemon(&fixture.config, interrupt), driver) },
    )
    .await
    .unwrap();

    assert_eq!(
        outcome.unwrap(),
        ShutdownReason::Signal("SIGTERM".to_string())
    );
    assert_eq!(exit_code(&Ok::<_, KvtilesError>(())), 0);

    // Every listener is closed once the daemon returns
    for port in [server.http_api_port, server.http_metrics_port, server.health_port] {
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }
}

#[tokio::test]
async fn test_missing_map_infos_fails_before_binding() {
    let fixture = fixture(false);

    let outcome = run_daemon(&fixture.config, std::future::pending()).await;

    assert!(matches!(
        outcome,
        Err(KvtilesError::Bootstrap(BootstrapError::NoMapInfos))
    ));
    assert_eq!(exit_code(&outcome), EXIT_FATAL);

    // Nothing was bound
    std::net::TcpListener::bind(("127.0.0.1", fixture.config.server.http_api_port)).unwrap();
    std::net::TcpListener::bind(("127.0.0.1", fixture.config.server.health_port)).unwrap();
}

#[tokio::test]
async fn test_missing_database_is_fatal() {
    let mut fixture = fixture(true);
    fixture.config.storage.db_path = fixture.config.storage.db_path.join("absent");

    let outcome = run_daemon(&fixture.config, std::future::pending()).await;

    assert!(matches!(
        outcome,
        Err(KvtilesError::Bootstrap(BootstrapError::StorageOpen { .. }))
    ));
    assert_eq!(exit_code(&outcome), EXIT_FATAL);
}

#[tokio::test]
async fn test_taken_port_is_fatal_and_releases_siblings() {
    let fixture = fixture(true);
    let _holder =
        std::net::TcpListener::bind(("127.0.0.1", fixture.config.server.http_api_port)).unwrap();

    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        run_daemon(&fixture.config, std::future::pending()),
    )
    .await
    .unwrap();

    assert!(matches!(
        outcome,
        Err(KvtilesError::Service(ServiceError::Bind { .. }))
    ));
    assert_eq!(exit_code(&outcome), EXIT_FATAL);

    std::net::TcpListener::bind(("127.0.0.1", fixture.config.server.http_metrics_port)).unwrap();
}
