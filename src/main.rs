use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use warp::http::StatusCode;
use warp::Filter;

use coderoom::config::Config;
use coderoom::registry::{self, RoomRegistry, DEFAULT_CONTENT, DEFAULT_LANGUAGE};
use coderoom::server::Server;
use coderoom::services::{
    AnalyticsSink, BuiltinCatalog, CodeAnalyzer, ExerciseCatalog, HttpAnalyzer, LogAnalytics,
    NoAnalyzer,
};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRoomRequest {
    username: String,
    exercise_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRoomResponse {
    room_id: String,
    user_id: String,
    username: String,
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

/// Checks that the configured PEM material is usable before electing TLS,
/// so a bad deployment falls back to plain HTTP/WS instead of refusing to
/// start.
fn tls_ready(cert_path: &str, key_path: &str) -> bool {
    let cert_file = match File::open(cert_path) {
        Ok(file) => file,
        Err(e) => {
            warn!("failed to open certificate file {}: {}", cert_path, e);
            return false;
        }
    };
    let key_file = match File::open(key_path) {
        Ok(file) => file,
        Err(e) => {
            warn!("failed to open private key file {}: {}", key_path, e);
            return false;
        }
    };

    let certs: Vec<_> = match rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
    {
        Ok(certs) => certs,
        Err(e) => {
            warn!("failed to parse certificate: {}", e);
            return false;
        }
    };
    let keys: Vec<_> = match rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(key_file))
        .collect::<Result<Vec<_>, _>>()
    {
        Ok(keys) => keys,
        Err(e) => {
            warn!("failed to parse private key: {}", e);
            return false;
        }
    };

    if certs.is_empty() || keys.is_empty() {
        warn!("certificate or key file contained no usable entries");
        return false;
    }
    true
}

async fn create_room(
    request: CreateRoomRequest,
    registry: Arc<RoomRegistry>,
    catalog: Arc<dyn ExerciseCatalog>,
    analytics: Arc<dyn AnalyticsSink>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let username = request.username.trim().to_string();
    if username.is_empty() {
        return Ok(warp::reply::with_status(
            warp::reply::json(&ErrorBody {
                message: "Username is required".into(),
            }),
            StatusCode::BAD_REQUEST,
        ));
    }

    let (content, language) = match &request.exercise_id {
        Some(id) => match catalog.get(id).await {
            Some(exercise) => (exercise.template, exercise.language),
            None => (DEFAULT_CONTENT.to_string(), DEFAULT_LANGUAGE.to_string()),
        },
        None => (DEFAULT_CONTENT.to_string(), DEFAULT_LANGUAGE.to_string()),
    };

    let created = registry.create_room(&username, content, language).await;
    analytics.emit(
        "room_created",
        serde_json::json!({ "roomId": created.room_id }),
    );

    Ok(warp::reply::with_status(
        warp::reply::json(&CreateRoomResponse {
            room_id: created.room_id,
            user_id: created.user_id,
            username,
        }),
        StatusCode::OK,
    ))
}

async fn get_exercise(
    id: String,
    catalog: Arc<dyn ExerciseCatalog>,
) -> Result<impl warp::Reply, warp::Rejection> {
    match catalog.get(&id).await {
        Some(exercise) => Ok(warp::reply::with_status(
            warp::reply::json(&exercise),
            StatusCode::OK,
        )),
        None => Ok(warp::reply::with_status(
            warp::reply::json(&ErrorBody {
                message: "Exercise not found".into(),
            }),
            StatusCode::NOT_FOUND,
        )),
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = Config::from_env();
    let registry = Arc::new(RoomRegistry::new(config.room_expiry));
    let catalog: Arc<dyn ExerciseCatalog> = Arc::new(BuiltinCatalog::new());
    let analytics: Arc<dyn AnalyticsSink> = Arc::new(LogAnalytics);
    let analyzer: Arc<dyn CodeAnalyzer> = match &config.analysis_url {
        Some(url) => Arc::new(HttpAnalyzer::new(url.clone())),
        None => Arc::new(NoAnalyzer),
    };

    let server = Arc::new(Server::new(registry.clone(), analyzer, analytics.clone()));
    let _sweeper = registry::start_sweeper(registry.clone(), analytics.clone(), config.sweep_interval);

    let ws_server = server.clone();
    let ws_route = warp::path("ws").and(warp::ws()).map(move |ws: warp::ws::Ws| {
        let server = ws_server.clone();
        ws.on_upgrade(move |socket| server.handle_connection(socket))
    });

    let create_registry = registry.clone();
    let create_catalog = catalog.clone();
    let create_analytics = analytics.clone();
    let rooms_route = warp::path("rooms")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(warp::any().map(move || create_registry.clone()))
        .and(warp::any().map(move || create_catalog.clone()))
        .and(warp::any().map(move || create_analytics.clone()))
        .and_then(create_room);

    let exercise_catalog = catalog.clone();
    let exercises_route = warp::path!("exercises" / String)
        .and(warp::get())
        .and(warp::any().map(move || exercise_catalog.clone()))
        .and_then(get_exercise);

    let static_files = warp::fs::dir("public");

    let routes = ws_route
        .or(rooms_route)
        .or(exercises_route)
        .or(static_files)
        .with(
            warp::cors()
                .allow_any_origin()
                .allow_headers(vec!["content-type"])
                .allow_methods(vec!["GET", "POST"]),
        );

    let addr = ([0, 0, 0, 0], config.port);
    match &config.tls {
        Some(tls) if tls_ready(&tls.cert_path, &tls.key_path) => {
            info!("serving HTTPS/WSS on port {}", config.port);
            warp::serve(routes)
                .tls()
                .cert_path(&tls.cert_path)
                .key_path(&tls.key_path)
                .run(addr)
                .await;
        }
        Some(_) => {
            warn!(
                "TLS material not usable, falling back to HTTP/WS on port {}",
                config.port
            );
            warp::serve(routes).run(addr).await;
        }
        None => {
            info!("serving HTTP/WS on port {}", config.port);
            warp::serve(routes).run(addr).await;
        }
    }
}
