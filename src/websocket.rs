//! Bridges scan events to a Home Assistant style websocket hub: matches and
//! failures become phone notifications, and notification actions drive the
//! scanner back.

use crate::coordinator::ScanCoordinator;
use crate::types::{MatchKind, PlateMatch, ScanEvent};
use futures::stream::SplitSink;
use futures::{pin_mut, FutureExt, SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc::Receiver, Mutex};
use tokio::time::delay_for;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use url::Url;

pub const RETRY_ACTION: &str = "RETRY_SCAN";
pub const SCAN_AGAIN_ACTION: &str = "SCAN_AGAIN";
pub const NEW_BOOKING_ACTION: &str = "NEW_BOOKING";

const ACTION_EVENT: &str = "mobile_app_notification_action";
const RECONNECT_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub host: String,
    pub access_token: Option<String>,
    pub notify_device: String,
}

/// What the hub can tell us.
#[derive(Debug, PartialEq)]
pub enum HubMessage {
    AuthRequired,
    AuthOk,
    AuthInvalid(String),
    Result { id: u64, success: bool, error: Value },
    Action(String),
    Other(String),
}

pub fn parse_hub_message(text: &str) -> Result<HubMessage, String> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| format!("Failed to parse hub message {:?}: {}", text, e))?;
    let tp = value["type"]
        .as_str()
        .ok_or_else(|| format!("Hub message without type: {}", text))?;
    Ok(match tp {
        "auth_required" => HubMessage::AuthRequired,
        "auth_ok" => HubMessage::AuthOk,
        "auth_invalid" => {
            HubMessage::AuthInvalid(value["message"].as_str().unwrap_or_default().to_string())
        }
        "result" => HubMessage::Result {
            id: value["id"]
                .as_u64()
                .ok_or_else(|| format!("Result without id: {}", text))?,
            success: value["success"].as_bool().unwrap_or(false),
            error: value["error"].clone(),
        },
        "event" if value["event"]["event_type"] == ACTION_EVENT => HubMessage::Action(
            value["event"]["data"]["action"]
                .as_str()
                .ok_or_else(|| format!("Notification action without action: {}", text))?
                .to_string(),
        ),
        other => HubMessage::Other(other.to_string()),
    })
}

/// Write half of a hub connection. Requests get increasing ids; the hub's
/// `result` for an id is logged against what was sent.
struct HubWriter {
    sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    next_id: u64,
    pending: HashMap<u64, &'static str>,
}

impl HubWriter {
    async fn authenticate(&mut self, token: &str) -> Result<(), tungstenite::Error> {
        let auth = json!({ "type": "auth", "access_token": token });
        self.sink.send(Message::text(auth.to_string())).await
    }

    async fn request(
        &mut self,
        mut body: Value,
        what: &'static str,
    ) -> Result<(), tungstenite::Error> {
        let id = self.next_id;
        self.next_id += 1;
        body["id"] = json!(id);
        self.pending.insert(id, what);
        self.sink.send(Message::text(body.to_string())).await
    }

    async fn call_service(
        &mut self,
        domain: &str,
        service: &str,
        data: Value,
        what: &'static str,
    ) -> Result<(), tungstenite::Error> {
        let body = json!({
            "type": "call_service",
            "domain": domain,
            "service": service,
            "service_data": data,
        });
        self.request(body, what).await
    }

    fn settle(&mut self, id: u64, success: bool, error: &Value) {
        match (self.pending.remove(&id), success) {
            (Some(what), true) => info!("Hub accepted {}", what),
            (Some(what), false) => error!("Hub rejected {}: {}", what, error),
            (None, _) => debug!("Result for unknown request {}", id),
        }
    }
}

pub async fn run(mut rx: Receiver<ScanEvent>, hub: HubSettings, coordinator: ScanCoordinator) {
    let url = match Url::parse(&format!("ws://{}/api/websocket", hub.host)) {
        Ok(url) => url,
        Err(e) => {
            error!("Invalid hub host {}: {}", hub.host, e);
            return;
        }
    };
    loop {
        match tokio_tungstenite::connect_async(&url).await {
            Ok((stream, _)) => serve_connection(stream, &mut rx, &hub, &coordinator).await,
            Err(e) => error!("Cannot reach hub at {}: {}", url, e),
        }
        info!("Reconnecting to hub in {:?}", RECONNECT_DELAY);
        delay_for(RECONNECT_DELAY).await;
    }
}

async fn serve_connection(
    stream: WebSocketStream<TcpStream>,
    rx: &mut Receiver<ScanEvent>,
    hub: &HubSettings,
    coordinator: &ScanCoordinator,
) {
    info!("Connected to hub");
    let (sink, incoming) = stream.split();
    let writer = Mutex::new(HubWriter {
        sink,
        next_id: 1,
        pending: HashMap::new(),
    });
    let from_hub = incoming
        .for_each(|message| async {
            match message {
                Ok(Message::Text(text)) => {
                    if let Err(e) = on_hub_text(&text, &writer, hub, coordinator).await {
                        error!("{}", e);
                    }
                }
                Ok(Message::Close(frame)) => warn!("Hub closed the connection: {:?}", frame),
                Ok(other) => debug!("Ignoring hub message {:?}", other),
                Err(e) => error!("Hub connection error: {}", e),
            }
        })
        .fuse();
    let from_scanner = rx
        .for_each(|event| async {
            if let Err(e) = forward_scan_event(event, &writer, hub).await {
                error!("Error forwarding scan event: {}", e);
            }
        })
        .fuse();
    pin_mut!(from_hub, from_scanner);
    futures::select!(
        _ = from_hub => info!("Hub connection dropped"),
        _ = from_scanner => error!("Scan event channel closed"),
    );
}

async fn on_hub_text(
    text: &str,
    writer: &Mutex<HubWriter>,
    hub: &HubSettings,
    coordinator: &ScanCoordinator,
) -> Result<(), String> {
    let message = parse_hub_message(text)?;
    debug!("Hub says {:?}", message);
    match message {
        HubMessage::AuthRequired => {
            let token = hub
                .access_token
                .as_deref()
                .ok_or_else(|| "ACCESS_TOKEN is not configured".to_string())?;
            writer
                .lock()
                .await
                .authenticate(token)
                .await
                .map_err(|e| format!("Error sending auth message: {}", e))
        }
        HubMessage::AuthOk => writer
            .lock()
            .await
            .request(
                json!({ "type": "subscribe_events", "event_type": ACTION_EVENT }),
                "notification action subscription",
            )
            .await
            .map_err(|e| format!("Error subscribing to notification actions: {}", e)),
        HubMessage::AuthInvalid(reason) => Err(format!("Hub rejected the access token: {}", reason)),
        HubMessage::Result { id, success, error } => {
            writer.lock().await.settle(id, success, &error);
            Ok(())
        }
        HubMessage::Action(action) => on_action(&action, coordinator),
        HubMessage::Other(tp) => {
            debug!("Ignoring hub message of type {}", tp);
            Ok(())
        }
    }
}

fn on_action(action: &str, coordinator: &ScanCoordinator) -> Result<(), String> {
    info!("Received notification action {}", action);
    match action {
        RETRY_ACTION => {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                if let Err(e) = coordinator.start().await {
                    warn!("Restart requested from notification failed: {}", e);
                }
            });
            Ok(())
        }
        SCAN_AGAIN_ACTION => coordinator.retry().map_err(|e| e.to_string()),
        // Handled by the booking app on the phone.
        other => {
            debug!("Ignoring action {}", other);
            Ok(())
        }
    }
}

fn match_message(m: &PlateMatch) -> String {
    let plate = &m.candidate.plate;
    match (m.kind, &m.record.owner_name) {
        (MatchKind::Appointment, _) => format!(
            "Plate {} has appointment {}",
            plate,
            m.record.appointment_id.as_deref().unwrap_or("?")
        ),
        (MatchKind::OwnerWithoutAppointment, Some(owner)) => {
            format!("Plate {} ({}) has no appointment", plate, owner)
        }
        (MatchKind::OwnerWithoutAppointment, None) => {
            format!("Plate {} is registered but has no appointment", plate)
        }
    }
}

/// Service data for the `notify` call announcing `event`, if it warrants one.
pub fn notification_for(event: &ScanEvent) -> Option<Value> {
    match event {
        ScanEvent::Matched(m) => {
            let mut actions = vec![json!({"action": SCAN_AGAIN_ACTION, "title": "Scan another"})];
            if m.kind == MatchKind::OwnerWithoutAppointment {
                actions.insert(0, json!({"action": NEW_BOOKING_ACTION, "title": "New booking"}));
            }
            Some(json!({
                "message": match_message(m),
                "data": {
                    "actions": actions,
                    "action_data": m.to_json(),
                }
            }))
        }
        ScanEvent::Failed(reason) => Some(json!({
            "message": format!("Plate scanner stopped: {}", reason),
            "data": {
                "actions": [{"action": RETRY_ACTION, "title": "Retry"}],
            }
        })),
        ScanEvent::Stopped => None,
    }
}

async fn forward_scan_event(
    event: ScanEvent,
    writer: &Mutex<HubWriter>,
    hub: &HubSettings,
) -> Result<(), tungstenite::Error> {
    info!("Forwarding scan event {:?}", event);
    let mut writer = writer.lock().await;
    if let Some(data) = notification_for(&event) {
        writer
            .call_service("notify", &hub.notify_device, data, "scan notification")
            .await?;
    }
    let (name, message) = match &event {
        ScanEvent::Matched(m) => (
            format!("License plate {}", m.candidate.plate),
            format!("was matched ({})", m.kind),
        ),
        ScanEvent::Failed(reason) => ("Plate scanner".to_string(), format!("failed: {}", reason)),
        ScanEvent::Stopped => ("Plate scanner".to_string(), "was stopped".to_string()),
    };
    let entry = json!({ "name": name, "message": message, "domain": "camera" });
    writer.call_service("logbook", "log", entry, "logbook entry").await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CandidateSource, PlateCandidate, PlateFormat, VehicleRecord};

    fn plate_match(kind: MatchKind, owner: Option<&str>) -> PlateMatch {
        let mut record = VehicleRecord::new("ABC1D23");
        record.owner_name = owner.map(str::to_string);
        if kind == MatchKind::Appointment {
            record.appointment_id = Some("31".to_string());
        }
        PlateMatch {
            kind,
            candidate: PlateCandidate {
                plate: "ABC1D23".to_string(),
                format: PlateFormat::Mercosul,
                source: CandidateSource::Pattern,
                confidence: 0.8,
            },
            record,
        }
    }

    #[test]
    fn appointment_notification_offers_scan_again() {
        let n = notification_for(&ScanEvent::Matched(plate_match(MatchKind::Appointment, None)))
            .unwrap();
        assert_eq!(n["message"], "Plate ABC1D23 has appointment 31");
        assert_eq!(n["data"]["actions"][0]["action"], SCAN_AGAIN_ACTION);
        assert_eq!(n["data"]["action_data"]["kind"], "appointment");
        assert_eq!(n["data"]["action_data"]["record"]["appointmentId"], "31");
    }

    #[test]
    fn owner_notification_offers_booking_first() {
        let n = notification_for(&ScanEvent::Matched(plate_match(
            MatchKind::OwnerWithoutAppointment,
            Some("Ana"),
        )))
        .unwrap();
        assert_eq!(n["message"], "Plate ABC1D23 (Ana) has no appointment");
        assert_eq!(n["data"]["actions"][0]["action"], NEW_BOOKING_ACTION);
        assert_eq!(n["data"]["actions"][1]["action"], SCAN_AGAIN_ACTION);
    }

    #[test]
    fn hub_messages_are_classified() {
        assert_eq!(
            parse_hub_message(r#"{"type":"auth_required","ha_version":"0.118"}"#),
            Ok(HubMessage::AuthRequired)
        );
        assert_eq!(
            parse_hub_message(r#"{"type":"auth_invalid","message":"bad token"}"#),
            Ok(HubMessage::AuthInvalid("bad token".to_string()))
        );
        assert_eq!(
            parse_hub_message(r#"{"id":3,"type":"result","success":true,"result":null}"#),
            Ok(HubMessage::Result {
                id: 3,
                success: true,
                error: Value::Null
            })
        );
        let action = r#"{"id":2,"type":"event","event":{
            "event_type":"mobile_app_notification_action",
            "data":{"action":"SCAN_AGAIN"}}}"#;
        assert_eq!(
            parse_hub_message(action),
            Ok(HubMessage::Action(SCAN_AGAIN_ACTION.to_string()))
        );
        let state_change = r#"{"id":2,"type":"event","event":{"event_type":"state_changed"}}"#;
        assert_eq!(
            parse_hub_message(state_change),
            Ok(HubMessage::Other("event".to_string()))
        );
    }

    #[test]
    fn malformed_hub_messages_are_errors() {
        assert!(parse_hub_message("not json").is_err());
        assert!(parse_hub_message(r#"{"id":1}"#).is_err());
        assert!(parse_hub_message(r#"{"type":"result","success":true}"#).is_err());
    }

    #[test]
    fn failure_notification_offers_retry() {
        let n = notification_for(&ScanEvent::Failed("camera permission denied".to_string()))
            .unwrap();
        assert_eq!(n["message"], "Plate scanner stopped: camera permission denied");
        assert_eq!(n["data"]["actions"][0]["action"], RETRY_ACTION);
        assert_eq!(notification_for(&ScanEvent::Stopped), None);
    }
}
