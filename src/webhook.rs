use crate::camera::FacingMode;
use crate::coordinator::ScanCoordinator;
use crate::db;
use crate::error::ScanError;
use crate::feed::FrameFeed;
use bytes::Buf;
use futures::StreamExt;
use image::io::Reader as ImageReader;
use log::{debug, error, info, warn};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::io::Cursor;
use std::sync::Arc;
use tokio::sync::Mutex;
use warp::http::StatusCode;
use warp::Filter;

const MAX_FRAME_BYTES: u64 = 8 * 1024 * 1024;
const HISTORY_LIMIT: u32 = 20;

#[derive(Debug)]
struct HandleFrameError;

impl warp::reject::Reject for HandleFrameError {}

pub fn routes(
    feed: FrameFeed,
    coordinator: ScanCoordinator,
    db_conn: Arc<Mutex<Connection>>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let with_coordinator = warp::any().map(move || coordinator.clone());

    let frame = warp::post()
        .and(warp::path!("frame"))
        .and(warp::filters::multipart::form().max_length(MAX_FRAME_BYTES))
        .and(warp::any().map(move || feed.clone()))
        .and_then(|form, feed| async {
            let result = handle_frame(form, feed).await;
            if let Err(e) = &result {
                error!("Error handling frame: {:?}", e);
            }
            result.map_err(|_| warp::reject::custom(HandleFrameError))
        });
    let start = warp::post()
        .and(warp::path!("scan" / "start"))
        .and(with_coordinator.clone())
        .and_then(start_scan);
    let stop = warp::post()
        .and(warp::path!("scan" / "stop"))
        .and(with_coordinator.clone())
        .and_then(stop_scan);
    let retry = warp::post()
        .and(warp::path!("scan" / "retry"))
        .and(with_coordinator.clone())
        .and_then(retry_scan);
    let status = warp::get()
        .and(warp::path!("scan" / "status"))
        .and(with_coordinator)
        .and_then(scan_status);
    let history = warp::get()
        .and(warp::path!("scan" / "history"))
        .and(warp::any().map(move || db_conn.clone()))
        .and_then(scan_history);

    frame.or(start).or(stop).or(retry).or(status).or(history)
}

pub async fn run(
    port: u16,
    feed: FrameFeed,
    coordinator: ScanCoordinator,
    db_conn: Arc<Mutex<Connection>>,
) {
    info!("Listening on port {}", port);
    warp::serve(routes(feed, coordinator, db_conn))
        .run(([0, 0, 0, 0], port))
        .await;
}

async fn handle_frame(
    mut form: warp::filters::multipart::FormData,
    feed: FrameFeed,
) -> Result<impl warp::Reply, failure::Error> {
    let mut frame = None;
    let mut facing = None;
    while let Some(part) = form.next().await {
        let part = part?;
        debug!("Got part {}", part.name());
        match part.name() {
            "upload" => {
                let data = read_part(part).await?;
                let image = ImageReader::new(Cursor::new(data))
                    .with_guessed_format()?
                    .decode()?;
                frame = Some(image);
            }
            "facing" => {
                let data = read_part(part).await?;
                let text = String::from_utf8_lossy(&data);
                facing = Some(
                    FacingMode::parse(&text)
                        .ok_or_else(|| format_err!("Unknown facing {:?}", text))?,
                );
            }
            _ => warn!("Ignoring part {}", part.name()),
        }
    }
    let frame = frame.ok_or_else(|| format_err!("Missing upload part"))?;
    if let Some(facing) = facing {
        feed.set_facing(facing);
    }
    feed.push(frame);
    Ok(warp::reply::with_status(
        warp::reply::json(&json!({ "frames": feed.frames_received() })),
        StatusCode::ACCEPTED,
    ))
}

async fn read_part(part: warp::filters::multipart::Part) -> Result<Vec<u8>, failure::Error> {
    let mut data: Vec<u8> = vec![];
    let mut stream = part.stream();
    while let Some(buf) = stream.next().await {
        data.extend_from_slice(buf?.bytes());
    }
    Ok(data)
}

fn reply(body: Value, status: StatusCode) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(warp::reply::json(&body), status)
}

fn error_status(e: &ScanError) -> StatusCode {
    match e {
        ScanError::AlreadyActive | ScanError::NotMatched | ScanError::Cancelled => {
            StatusCode::CONFLICT
        }
        ScanError::Camera(_) | ScanError::Engine(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn start_scan(coordinator: ScanCoordinator) -> Result<impl warp::Reply, Infallible> {
    Ok(match coordinator.start().await {
        Ok(()) => reply(coordinator.snapshot().to_json(), StatusCode::OK),
        Err(e) => reply(json!({ "error": e.to_string() }), error_status(&e)),
    })
}

async fn stop_scan(coordinator: ScanCoordinator) -> Result<impl warp::Reply, Infallible> {
    coordinator.stop();
    Ok(reply(coordinator.snapshot().to_json(), StatusCode::OK))
}

async fn retry_scan(coordinator: ScanCoordinator) -> Result<impl warp::Reply, Infallible> {
    Ok(match coordinator.retry() {
        Ok(()) => reply(coordinator.snapshot().to_json(), StatusCode::OK),
        Err(e) => reply(json!({ "error": e.to_string() }), error_status(&e)),
    })
}

async fn scan_status(coordinator: ScanCoordinator) -> Result<impl warp::Reply, Infallible> {
    Ok(reply(coordinator.snapshot().to_json(), StatusCode::OK))
}

async fn scan_history(db_conn: Arc<Mutex<Connection>>) -> Result<impl warp::Reply, Infallible> {
    let rows = {
        let conn = db_conn.lock().await;
        db::recent_matches(&conn, HISTORY_LIMIT)
    };
    Ok(reply(json!({ "matches": rows }), StatusCode::OK))
}
