use crate::error::LookupError;
use crate::types::{LookupOutcome, VehicleRecord};
use futures::future::{BoxFuture, FutureExt};
use log::debug;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

/// Backend plate lookup.
pub trait PlateLookup: Send + Sync {
    fn lookup<'a>(&'a self, plate: &'a str) -> BoxFuture<'a, Result<LookupOutcome, LookupError>>;
}

pub struct HttpLookupClient {
    client: reqwest::Client,
    url: Url,
    service_point: i64,
    access_token: Option<String>,
}

impl HttpLookupClient {
    pub fn new(
        url: Url,
        service_point: i64,
        access_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, LookupError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LookupError::Network(e.to_string()))?;
        Ok(HttpLookupClient {
            client,
            url,
            service_point,
            access_token,
        })
    }

    async fn fetch(&self, plate: &str) -> Result<LookupOutcome, LookupError> {
        let mut request = self.client.post(self.url.clone()).json(&json!({
            "idPontoAtendimento": self.service_point,
            "placa": plate,
        }));
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| LookupError::Network(e.to_string()))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::NO_CONTENT {
            return Ok(LookupOutcome::NotRegistered);
        }
        if !status.is_success() {
            return Err(LookupError::Status(status.as_u16()));
        }
        let body = response
            .text()
            .await
            .map_err(|e| LookupError::Network(e.to_string()))?;
        debug!("Lookup for {} returned {}", plate, body);
        if body.trim().is_empty() {
            return Ok(LookupOutcome::NotRegistered);
        }
        let value: Value =
            serde_json::from_str(&body).map_err(|e| LookupError::Malformed(e.to_string()))?;
        Ok(interpret_response(plate, value))
    }
}

impl PlateLookup for HttpLookupClient {
    fn lookup<'a>(&'a self, plate: &'a str) -> BoxFuture<'a, Result<LookupOutcome, LookupError>> {
        self.fetch(plate).boxed()
    }
}

fn id_field(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn appointment_id(record: &Value) -> Option<String> {
    id_field(&record["idAgendamento"]).or_else(|| id_field(&record["agendamento"]["id"]))
}

fn owner_name(record: &Value) -> Option<String> {
    ["nomeAssociado", "nomeProprietario"]
        .iter()
        .filter_map(|k| record[*k].as_str())
        .chain(record["associado"]["nome"].as_str())
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// Maps a backend payload onto the three lookup outcomes. An appointment id
/// wins; any other non-empty record means the vehicle is known but unbooked.
pub fn interpret_response(plate: &str, value: Value) -> LookupOutcome {
    let record = match value {
        Value::Array(mut items) => {
            if items.is_empty() {
                return LookupOutcome::NotRegistered;
            }
            items.swap_remove(0)
        }
        other => other,
    };
    match &record {
        Value::Object(map) if !map.is_empty() => {}
        _ => return LookupOutcome::NotRegistered,
    }
    let vehicle = VehicleRecord {
        plate: record["placa"].as_str().unwrap_or(plate).to_string(),
        appointment_id: appointment_id(&record),
        owner_name: owner_name(&record),
        raw: record,
    };
    if vehicle.appointment_id.is_some() {
        LookupOutcome::Appointment(vehicle)
    } else {
        LookupOutcome::OwnerWithoutAppointment(vehicle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warp::Filter;

    #[test]
    fn appointment_id_wins() {
        let outcome = interpret_response(
            "ABC1234",
            json!({"placa": "ABC1234", "idAgendamento": 42, "nomeAssociado": "Ana"}),
        );
        match outcome {
            LookupOutcome::Appointment(r) => {
                assert_eq!(r.appointment_id.as_deref(), Some("42"));
                assert_eq!(r.owner_name.as_deref(), Some("Ana"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn nested_appointment_and_owner() {
        let outcome = interpret_response(
            "ABC1D23",
            json!([{"agendamento": {"id": "a-7"}, "associado": {"nome": "Bia"}}]),
        );
        match outcome {
            LookupOutcome::Appointment(r) => {
                assert_eq!(r.plate, "ABC1D23");
                assert_eq!(r.appointment_id.as_deref(), Some("a-7"));
                assert_eq!(r.owner_name.as_deref(), Some("Bia"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn owner_without_appointment() {
        let outcome = interpret_response(
            "ABC1234",
            json!({"placa": "ABC1234", "idAgendamento": null, "associado": {"nome": "Caio"}}),
        );
        match outcome {
            LookupOutcome::OwnerWithoutAppointment(r) => {
                assert_eq!(r.appointment_id, None);
                assert_eq!(r.owner_name.as_deref(), Some("Caio"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn empty_payloads_are_not_registered() {
        for value in vec![Value::Null, json!([]), json!({}), json!("")] {
            assert_eq!(
                interpret_response("ABC1234", value),
                LookupOutcome::NotRegistered
            );
        }
    }

    #[tokio::test]
    async fn http_client_posts_service_point_and_plate() {
        let route = warp::post()
            .and(warp::path!("placa"))
            .and(warp::header::<String>("authorization"))
            .and(warp::body::json())
            .map(|auth: String, body: Value| {
                assert_eq!(auth, "Bearer secret");
                assert_eq!(body["idPontoAtendimento"], 7);
                if body["placa"] == "ABC1234" {
                    warp::reply::with_status(
                        warp::reply::json(&json!({"idAgendamento": 9})),
                        warp::http::StatusCode::OK,
                    )
                } else {
                    warp::reply::with_status(
                        warp::reply::json(&Value::Null),
                        warp::http::StatusCode::NOT_FOUND,
                    )
                }
            });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let url = Url::parse(&format!("http://{}/placa", addr)).unwrap();
        let client =
            HttpLookupClient::new(url, 7, Some("secret".to_string()), Duration::from_secs(5))
                .unwrap();
        match client.lookup("ABC1234").await.unwrap() {
            LookupOutcome::Appointment(r) => assert_eq!(r.appointment_id.as_deref(), Some("9")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            client.lookup("ZZZ9999").await.unwrap(),
            LookupOutcome::NotRegistered
        );
    }

    #[tokio::test]
    async fn server_errors_surface_as_lookup_errors() {
        let route = warp::any().map(|| {
            warp::reply::with_status("boom", warp::http::StatusCode::INTERNAL_SERVER_ERROR)
        });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let url = Url::parse(&format!("http://{}/placa", addr)).unwrap();
        let client = HttpLookupClient::new(url, 1, None, Duration::from_secs(5)).unwrap();
        assert!(matches!(
            client.lookup("ABC1234").await,
            Err(LookupError::Status(500))
        ));
    }
}
