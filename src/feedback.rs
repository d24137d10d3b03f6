use crate::tags;
use nostr::nips::nip04;
use nostr::{Event, EventBuilder, Keys, Kind, Tag, TagKind};
use std::fmt;

/// Per-job status carried in the `status` tag of feedback events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    PaymentRequired,
    PaymentRejected,
    Processing,
    Success,
    Error,
    ChainScheduled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::PaymentRequired => "payment-required",
            JobStatus::PaymentRejected => "payment-rejected",
            JobStatus::Processing => "processing",
            JobStatus::Success => "success",
            JobStatus::Error => "error",
            JobStatus::ChainScheduled => "chain-scheduled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Price attached to a feedback event when the status implies one.
#[derive(Debug, Clone)]
pub struct Quote {
    pub amount_sats: u64,
    pub bolt11: Option<String>,
}

fn human_description(status: JobStatus, task: &str) -> String {
    match status {
        JobStatus::PaymentRequired => format!("NIP90 DVM task {task} requires payment"),
        JobStatus::PaymentRejected => format!("NIP90 DVM task {task} rejected the payment"),
        JobStatus::Processing => format!("NIP90 DVM task {task} started processing"),
        JobStatus::Success => format!("NIP90 DVM task {task} finished"),
        JobStatus::Error => format!("NIP90 DVM task {task} failed"),
        JobStatus::ChainScheduled => format!("NIP90 DVM task {task} waiting for job input"),
    }
}

fn custom_tag(name: &str, values: Vec<String>) -> Tag {
    Tag::Generic(TagKind::Custom(name.to_string()), values)
}

/// Build a signed feedback event for a request.
///
/// For an encrypted request the status payload (all inner tags plus the
/// human-readable content) is nip04-encrypted to the requester and the outer
/// tag set carries only the `encrypted` marker and the `p` tag.
pub fn status_event(
    keys: &Keys,
    request: &Event,
    task: &str,
    status: JobStatus,
    quote: Option<&Quote>,
    content: Option<String>,
) -> anyhow::Result<Event> {
    let description = human_description(status, task);
    let content = content.unwrap_or_else(|| description.clone());

    let mut reply_tags = vec![
        Tag::event(request.id),
        custom_tag("alt", vec![description]),
        custom_tag("status", vec![status.as_str().to_string()]),
    ];

    let encrypted = tags::is_encrypted(request);
    if !encrypted {
        reply_tags.push(Tag::public_key(request.pubkey));
    }

    if let Some(quote) = quote {
        reply_tags.push(Tag::Amount {
            millisats: quote.amount_sats * 1000,
            bolt11: quote.bolt11.clone(),
        });
    }

    let (content, reply_tags) = if encrypted {
        reply_tags.push(custom_tag("content", vec![content]));
        let ciphertext = tags::encrypt_tag_list(keys, &request.pubkey, &reply_tags)?;
        let outer = vec![tags::encrypted_marker(), Tag::public_key(request.pubkey)];
        (ciphertext, outer)
    } else {
        (content, reply_tags)
    };

    Ok(EventBuilder::new(Kind::JobFeedback, content, reply_tags).to_event(keys)?)
}

/// Build the signed reply event of kind `request.kind + 1000` carrying the
/// final result. The original request rides along as a `request` tag; the
/// request's `i` tags are echoed only when the exchange is unencrypted.
pub fn reply_event(keys: &Keys, request: &Event, payload: String) -> anyhow::Result<Event> {
    let encrypted = tags::is_encrypted(request);

    let mut reply_tags = vec![
        Tag::Request(request.clone()),
        Tag::event(request.id),
        Tag::public_key(request.pubkey),
        custom_tag(
            "alt",
            vec![format!(
                "This is the result of a NIP90 DVM task with kind {}",
                request.kind.as_u64()
            )],
        ),
        custom_tag("status", vec![JobStatus::Success.as_str().to_string()]),
    ];

    if encrypted {
        reply_tags.push(tags::encrypted_marker());
    } else {
        for tag in request.tags.iter() {
            if tag.as_vec().first().map(|s| s.as_str()) == Some("i") {
                reply_tags.push(tag.clone());
            }
        }
    }

    let content = if encrypted {
        nip04::encrypt(keys.secret_key()?, &request.pubkey, payload)?
    } else {
        payload
    };

    Ok(EventBuilder::new(tags::result_kind(request.kind), content, reply_tags).to_event(keys)?)
}

/// Quoted price in sats read back from one of our feedback events. Absent
/// (or encrypted away) amount tags count as zero, the permissive reading.
pub fn quoted_amount_sats(feedback: &Event) -> u64 {
    feedback
        .tags
        .iter()
        .find_map(|t| {
            let vec = t.as_vec();
            if vec.first().map(|s| s.as_str()) == Some("amount") {
                vec.get(1).and_then(|v| v.parse::<u64>().ok())
            } else {
                None
            }
        })
        .map(|msats| msats / 1000)
        .unwrap_or(0)
}

/// Event id referenced by a feedback event's `e` tag.
pub fn referenced_request_id(feedback: &Event) -> Option<nostr::EventId> {
    feedback.tags.iter().find_map(|t| {
        let vec = t.as_vec();
        if vec.first().map(|s| s.as_str()) == Some("e") {
            vec.get(1).and_then(|v| nostr::EventId::from_hex(v).ok())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tags::{decrypt_tag_list, encrypted_marker};
    use nostr::{EventId, JsonUtil};

    fn tag_values<'a>(event: &'a Event, name: &str) -> Option<Vec<String>> {
        event.tags.iter().map(|t| t.as_vec()).find(|v| v.first().map(|s| s.as_str()) == Some(name))
    }

    fn plain_request(keys: &Keys) -> Event {
        EventBuilder::new(
            Kind::JobRequest(5002),
            "",
            vec![custom_tag("i", vec!["https://example.com/a.mp3".to_string(), "url".to_string()])],
        )
        .to_event(keys)
        .unwrap()
    }

    fn encrypted_request(keys: &Keys, dvm: &Keys) -> Event {
        EventBuilder::new(
            Kind::JobRequest(5002),
            "<ciphertext>",
            vec![Tag::public_key(dvm.public_key()), encrypted_marker()],
        )
        .to_event(keys)
        .unwrap()
    }

    #[test]
    fn feedback_carries_status_amount_and_addressee() {
        let dvm = Keys::generate();
        let requester = Keys::generate();
        let request = plain_request(&requester);

        let event = status_event(
            &dvm,
            &request,
            "extract-text",
            JobStatus::PaymentRequired,
            Some(&Quote {
                amount_sats: 50,
                bolt11: Some("lnbc500n1...".to_string()),
            }),
            None,
        )
        .unwrap();

        assert_eq!(event.kind, Kind::JobFeedback);
        assert_eq!(
            tag_values(&event, "status").unwrap()[1],
            "payment-required"
        );
        assert_eq!(tag_values(&event, "e").unwrap()[1], request.id.to_hex());
        assert_eq!(
            tag_values(&event, "p").unwrap()[1],
            request.pubkey.to_string()
        );
        let amount = tag_values(&event, "amount").unwrap();
        assert_eq!(amount[1], "50000");
        assert_eq!(amount[2], "lnbc500n1...");
        assert_eq!(quoted_amount_sats(&event), 50);
        assert_eq!(referenced_request_id(&event), Some(request.id));
    }

    #[test]
    fn encrypted_feedback_hoists_p_and_hides_payload() {
        let dvm = Keys::generate();
        let requester = Keys::generate();
        let request = encrypted_request(&requester, &dvm);

        let event = status_event(
            &dvm,
            &request,
            "extract-text",
            JobStatus::Processing,
            Some(&Quote { amount_sats: 21, bolt11: None }),
            None,
        )
        .unwrap();

        // outer tags are only the marker and the addressee
        let names: Vec<String> = event
            .tags
            .iter()
            .filter_map(|t| t.as_vec().first().cloned())
            .collect();
        assert_eq!(names, vec!["encrypted".to_string(), "p".to_string()]);

        let inner = decrypt_tag_list(&requester, &dvm.public_key(), &event.content).unwrap();
        let inner: Vec<Vec<String>> = inner.iter().map(|t| t.as_vec()).collect();
        assert!(inner.iter().any(|v| v[0] == "status" && v[1] == "processing"));
        assert!(inner.iter().any(|v| v[0] == "amount" && v[1] == "21000"));
        assert!(inner.iter().any(|v| v[0] == "e"));
        assert!(inner.iter().any(|v| v[0] == "content"));
    }

    #[test]
    fn reply_echoes_request_and_inputs() {
        let dvm = Keys::generate();
        let requester = Keys::generate();
        let request = plain_request(&requester);

        let event = reply_event(&dvm, &request, "transcript text".to_string()).unwrap();

        assert_eq!(event.kind.as_u64(), request.kind.as_u64() + 1000);
        assert_eq!(event.content, "transcript text");
        assert_eq!(tag_values(&event, "status").unwrap()[1], "success");
        assert_eq!(tag_values(&event, "i").unwrap()[1], "https://example.com/a.mp3");
        let embedded = Event::from_json(&tag_values(&event, "request").unwrap()[1]).unwrap();
        assert_eq!(embedded.id, request.id);
    }

    #[test]
    fn reply_to_encrypted_request_is_encrypted_with_outer_p() {
        let dvm = Keys::generate();
        let requester = Keys::generate();
        let request = encrypted_request(&requester, &dvm);

        let event = reply_event(&dvm, &request, "secret result".to_string()).unwrap();

        assert!(tag_values(&event, "p").is_some());
        assert!(tag_values(&event, "encrypted").is_some());
        assert!(tag_values(&event, "i").is_none());
        assert_ne!(event.content, "secret result");
        let cleartext = nip04::decrypt(
            &requester.secret_key().unwrap(),
            &dvm.public_key(),
            &event.content,
        )
        .unwrap();
        assert_eq!(cleartext, "secret result");
    }

    #[test]
    fn missing_amount_tag_reads_as_zero() {
        let keys = Keys::generate();
        let event = EventBuilder::new(Kind::JobFeedback, "", vec![Tag::event(EventId::all_zeros())])
            .to_event(&keys)
            .unwrap();
        assert_eq!(quoted_amount_sats(&event), 0);
    }
}
