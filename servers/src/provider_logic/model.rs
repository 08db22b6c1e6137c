use lib_session::{ClassOfService, DataState, Domain, DomainMessage, RequestMsg, StreamId, StreamState};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    Request,
    Close,
    Status,
}

/// One inbound client frame, e.g.
/// `{"kind":"request","domain":"item","streamId":5,"name":"TRI.N","serviceId":1}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    pub kind: ClientKind,
    pub domain: String,
    pub stream_id: StreamId,
    pub name: Option<String>,
    #[serde(default)]
    pub filter: u32,
    pub service_id: Option<u16>,
    #[serde(default)]
    pub private_stream: bool,
    #[serde(default)]
    pub no_refresh: bool,
    pub class_of_service: Option<ClassOfService>,
    pub stream_state: Option<StreamState>,
    pub data_state: Option<DataState>,
}

/// What the coordinator should do with an inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message { domain: Domain, msg: DomainMessage },
    UnsupportedDomain { stream_id: StreamId, label: String },
}

impl ClientMessage {
    pub fn into_inbound(self) -> Inbound {
        let Some(domain) = Domain::from_label(&self.domain) else {
            return Inbound::UnsupportedDomain {
                stream_id: self.stream_id,
                label: self.domain,
            };
        };

        let msg = match self.kind {
            ClientKind::Request => DomainMessage::Request(RequestMsg {
                stream_id: self.stream_id,
                name: self.name,
                filter: self.filter,
                service_id: self.service_id,
                private_stream: self.private_stream,
                no_refresh: self.no_refresh,
                class_of_service: self.class_of_service,
            }),
            ClientKind::Close => DomainMessage::Close {
                stream_id: self.stream_id,
            },
            ClientKind::Status => match (self.stream_state, self.data_state) {
                (Some(stream_state), Some(data_state)) => DomainMessage::Status {
                    stream_id: self.stream_id,
                    stream_state,
                    data_state,
                },
                _ => DomainMessage::Undecodable {
                    stream_id: self.stream_id,
                    stream_state: self.stream_state,
                },
            },
        };
        Inbound::Message { domain, msg }
    }
}

/// Decodes a client text frame.
///
/// Returns `None` when the frame cannot be attributed to a stream at all. A
/// frame that names a domain and stream but is otherwise malformed becomes
/// [`DomainMessage::Undecodable`], so the peer gets a rejection on that stream.
pub fn parse_client_frame(text: &str) -> Option<Inbound> {
    let value: Value = serde_json::from_str(text).ok()?;

    let domain = value.get("domain").and_then(Value::as_str).map(str::to_string);
    let stream_id = value
        .get("streamId")
        .and_then(Value::as_i64)
        .and_then(|id| StreamId::try_from(id).ok());

    match serde_json::from_value::<ClientMessage>(value) {
        Ok(msg) => Some(msg.into_inbound()),
        Err(e) => {
            let (label, stream_id) = (domain?, stream_id?);
            log::debug!("undecodable {} frame on stream {}: {}", label, stream_id, e);
            match Domain::from_label(&label) {
                Some(domain) => Some(Inbound::Message {
                    domain,
                    msg: DomainMessage::Undecodable {
                        stream_id,
                        stream_state: None,
                    },
                }),
                None => Some(Inbound::UnsupportedDomain { stream_id, label }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_request() {
        let inbound = parse_client_frame(
            r#"{"kind":"request","domain":"item","streamId":5,"name":"TRI.N","serviceId":1,"privateStream":true}"#,
        )
        .unwrap();
        match inbound {
            Inbound::Message {
                domain: Domain::Item,
                msg: DomainMessage::Request(req),
            } => {
                assert_eq!(req.stream_id, 5);
                assert_eq!(req.name.as_deref(), Some("TRI.N"));
                assert_eq!(req.service_id, Some(1));
                assert!(req.private_stream);
                assert!(!req.no_refresh);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_market_price_label_maps_to_item() {
        let inbound = parse_client_frame(r#"{"kind":"close","domain":"marketPrice","streamId":9}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Message {
                domain: Domain::Item,
                msg: DomainMessage::Close { stream_id: 9 },
            }
        );
    }

    #[test]
    fn test_unknown_domain() {
        let inbound = parse_client_frame(r#"{"kind":"request","domain":"symbolList","streamId":4}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::UnsupportedDomain {
                stream_id: 4,
                label: "symbolList".to_string(),
            }
        );
    }

    #[test]
    fn test_tunnel_status() {
        let inbound = parse_client_frame(
            r#"{"kind":"status","domain":"tunnel","streamId":7,"streamState":"closedRecover","dataState":"suspect"}"#,
        )
        .unwrap();
        assert_eq!(
            inbound,
            Inbound::Message {
                domain: Domain::Tunnel,
                msg: DomainMessage::Status {
                    stream_id: 7,
                    stream_state: StreamState::ClosedRecover,
                    data_state: DataState::Suspect,
                },
            }
        );
    }

    #[test]
    fn test_status_without_states_is_undecodable() {
        let inbound = parse_client_frame(r#"{"kind":"status","domain":"tunnel","streamId":7}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Message {
                domain: Domain::Tunnel,
                msg: DomainMessage::Undecodable {
                    stream_id: 7,
                    stream_state: None,
                },
            }
        );
    }

    #[test]
    fn test_status_without_data_state_keeps_stream_state() {
        let inbound =
            parse_client_frame(r#"{"kind":"status","domain":"item","streamId":9,"streamState":"closed"}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Message {
                domain: Domain::Item,
                msg: DomainMessage::Undecodable {
                    stream_id: 9,
                    stream_state: Some(StreamState::Closed),
                },
            }
        );
    }

    #[test]
    fn test_bad_field_with_known_stream_is_undecodable() {
        let inbound = parse_client_frame(r#"{"kind":"subscribe","domain":"login","streamId":1}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Message {
                domain: Domain::Login,
                msg: DomainMessage::Undecodable {
                    stream_id: 1,
                    stream_state: None,
                },
            }
        );
    }

    #[test]
    fn test_unattributable_frames_are_dropped() {
        assert!(parse_client_frame("not json").is_none());
        assert!(parse_client_frame(r#"{"kind":"request","domain":"login"}"#).is_none());
        assert!(parse_client_frame(r#"{"kind":"request","streamId":1}"#).is_none());
    }
}
