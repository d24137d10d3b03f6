use anyhow::anyhow;
use nostr::nips::nip04;
use nostr::{Event, Keys, Kind, PublicKey, Tag, TagKind};
use std::fmt;
use std::str::FromStr;

pub const KIND_JOB_REQUEST_FIRST: u64 = 5000;
pub const KIND_JOB_REQUEST_LAST: u64 = 5999;
pub const KIND_GENERIC_REQUEST: u64 = 5999;
pub const KIND_JOB_RESULT_FIRST: u64 = 6000;
pub const KIND_JOB_RESULT_LAST: u64 = 6999;
pub const KIND_DM: u64 = 4;

pub fn is_job_request_kind(kind: Kind) -> bool {
    (KIND_JOB_REQUEST_FIRST..=KIND_JOB_REQUEST_LAST).contains(&kind.as_u64())
}

pub fn is_job_result_kind(kind: Kind) -> bool {
    (KIND_JOB_RESULT_FIRST..=KIND_JOB_RESULT_LAST).contains(&kind.as_u64())
}

/// Kind of the reply event for a given request kind.
pub fn result_kind(request_kind: Kind) -> Kind {
    Kind::from(request_kind.as_u64() + 1000)
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TagError {
    #[error("malformed {0} tag")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Url,
    Text,
    Event,
    Job,
}

impl FromStr for InputKind {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "url" => Ok(InputKind::Url),
            "text" => Ok(InputKind::Text),
            "event" => Ok(InputKind::Event),
            "job" => Ok(InputKind::Job),
            _ => Err(TagError::Malformed("i")),
        }
    }
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InputKind::Url => "url",
            InputKind::Text => "text",
            InputKind::Event => "event",
            InputKind::Job => "job",
        };
        write!(f, "{s}")
    }
}

/// A typed `i` tag: `["i", <value>, <kind>, <relay?>, <marker?>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInput {
    pub value: String,
    pub kind: InputKind,
    pub relay: Option<String>,
    pub marker: Option<String>,
}

/// Collect the typed inputs of a request. An `i` tag with fewer than three
/// elements or an unknown input kind is malformed.
pub fn job_inputs(event: &Event) -> Result<Vec<JobInput>, TagError> {
    let mut inputs = vec![];
    for tag in event.tags.iter() {
        let vec = tag.as_vec();
        if vec.first().map(|s| s.as_str()) != Some("i") {
            continue;
        }
        if vec.len() < 3 {
            return Err(TagError::Malformed("i"));
        }
        inputs.push(JobInput {
            value: vec[1].clone(),
            kind: vec[2].parse()?,
            relay: vec.get(3).cloned().filter(|s| !s.is_empty()),
            marker: vec.get(4).cloned().filter(|s| !s.is_empty()),
        });
    }
    Ok(inputs)
}

pub fn p_tag(event: &Event) -> Option<PublicKey> {
    event.tags.iter().find_map(|t| {
        let vec = t.as_vec();
        if vec.first().map(|s| s.as_str()) == Some("p") {
            vec.get(1).and_then(|s| PublicKey::from_str(s).ok())
        } else {
            None
        }
    })
}

pub fn bid_msats(event: &Event) -> Option<u64> {
    first_tag_value(event, "bid").and_then(|s| s.parse().ok())
}

pub fn cashu_token(event: &Event) -> Option<String> {
    first_tag_value(event, "cashu")
}

pub fn output_mime(event: &Event) -> Option<String> {
    first_tag_value(event, "output")
}

pub fn is_encrypted(event: &Event) -> bool {
    event
        .tags
        .iter()
        .any(|t| t.as_vec().first().map(|s| s.as_str()) == Some("encrypted"))
}

/// Value of a `["param", <name>, <value>]` tag.
pub fn param(event: &Event, name: &str) -> Option<String> {
    event.tags.iter().find_map(|t| {
        let vec = t.as_vec();
        if vec.first().map(|s| s.as_str()) == Some("param") && vec.get(1).map(|s| s.as_str()) == Some(name)
        {
            vec.get(2).cloned()
        } else {
            None
        }
    })
}

fn first_tag_value(event: &Event, name: &str) -> Option<String> {
    event.tags.iter().find_map(|t| {
        let vec = t.as_vec();
        if vec.first().map(|s| s.as_str()) == Some(name) {
            vec.get(1).cloned()
        } else {
            None
        }
    })
}

pub fn encrypted_marker() -> Tag {
    Tag::Generic(TagKind::Custom("encrypted".to_string()), vec![])
}

/// Rewrite a privately-addressed request: the content is a nip04-encrypted
/// JSON tag list which replaces the event's tags. The `p` and `encrypted`
/// markers are kept so downstream routing and reply encryption still see
/// them. Returns the event unchanged when it carries no `encrypted` tag.
pub fn decrypt_request_tags(event: Event, keys: &Keys) -> anyhow::Result<Event> {
    if !is_encrypted(&event) {
        return Ok(event);
    }

    let p_tag = p_tag(&event).ok_or(anyhow!("encrypted request without p tag: {}", event.id))?;
    if p_tag != keys.public_key() {
        return Err(anyhow!("request is not encrypted to us: {}", event.id));
    }

    let mut tags = decrypt_tag_list(keys, &event.pubkey, &event.content)?;
    tags.push(Tag::public_key(p_tag));
    tags.push(encrypted_marker());

    Ok(Event::new(
        event.id(),
        event.author(),
        event.created_at(),
        event.kind(),
        tags,
        event.content(),
        event.signature(),
    ))
}

/// Encrypt a tag list to `to` as a JSON document, the inverse of the
/// rewriting done by [`decrypt_request_tags`].
pub fn encrypt_tag_list(keys: &Keys, to: &PublicKey, tags: &[Tag]) -> anyhow::Result<String> {
    let json = serde_json::to_string(tags)?;
    Ok(nip04::encrypt(keys.secret_key()?, to, json)?)
}

pub fn decrypt_tag_list(keys: &Keys, from: &PublicKey, content: &str) -> anyhow::Result<Vec<Tag>> {
    let cleartext = nip04::decrypt(keys.secret_key()?, from, content)?;
    Ok(serde_json::from_str(&cleartext)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use nostr::EventBuilder;

    fn request(tags: Vec<Tag>) -> Event {
        let keys = Keys::generate();
        EventBuilder::new(Kind::JobRequest(5000), "", tags)
            .to_event(&keys)
            .unwrap()
    }

    fn tag(parts: &[&str]) -> Tag {
        Tag::Generic(
            TagKind::Custom(parts[0].to_string()),
            parts[1..].iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn parses_typed_inputs() {
        let event = request(vec![
            tag(&["i", "https://example.com/a.mp3", "url"]),
            tag(&["i", "deadbeef", "job", "wss://relay.example.com"]),
            tag(&["bid", "50000"]),
        ]);

        let inputs = job_inputs(&event).unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[0].kind, InputKind::Url);
        assert_eq!(inputs[0].value, "https://example.com/a.mp3");
        assert_eq!(inputs[1].kind, InputKind::Job);
        assert_eq!(inputs[1].relay.as_deref(), Some("wss://relay.example.com"));
        assert_eq!(bid_msats(&event), Some(50_000));
    }

    #[test]
    fn truncated_input_tag_is_malformed() {
        let event = request(vec![tag(&["i", "https://example.com/a.mp3"])]);
        assert!(job_inputs(&event).is_err());
    }

    #[test]
    fn unknown_input_kind_is_malformed() {
        let event = request(vec![tag(&["i", "something", "carrier-pigeon"])]);
        assert!(job_inputs(&event).is_err());
    }

    #[test]
    fn result_kind_is_request_plus_1000() {
        assert_eq!(result_kind(Kind::JobRequest(5002)).as_u64(), 6002);
        assert!(is_job_result_kind(result_kind(Kind::JobRequest(5999))));
    }

    #[test]
    fn tag_list_encryption_round_trips() {
        let ours = Keys::generate();
        let theirs = Keys::generate();
        let tags = vec![
            tag(&["i", "what is the answer", "text"]),
            tag(&["param", "model", "base"]),
            tag(&["output", "text/plain"]),
        ];

        let ciphertext = encrypt_tag_list(&ours, &theirs.public_key(), &tags).unwrap();
        let decrypted = decrypt_tag_list(&theirs, &ours.public_key(), &ciphertext).unwrap();

        assert_eq!(
            tags.iter().map(|t| t.as_vec()).collect::<Vec<_>>(),
            decrypted.iter().map(|t| t.as_vec()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn decrypts_private_request_and_keeps_markers() {
        let dvm = Keys::generate();
        let requester = Keys::generate();
        let inner = vec![tag(&["i", "hello", "text"]), tag(&["bid", "1000"])];
        let content = encrypt_tag_list(&requester, &dvm.public_key(), &inner).unwrap();

        let event = EventBuilder::new(
            Kind::JobRequest(5050),
            content,
            vec![Tag::public_key(dvm.public_key()), encrypted_marker()],
        )
        .to_event(&requester)
        .unwrap();

        let rewritten = decrypt_request_tags(event, &dvm).unwrap();
        assert!(is_encrypted(&rewritten));
        assert_eq!(p_tag(&rewritten), Some(dvm.public_key()));
        assert_eq!(bid_msats(&rewritten), Some(1000));
        assert_eq!(job_inputs(&rewritten).unwrap()[0].value, "hello");
    }

    #[test]
    fn rejects_private_request_for_another_dvm() {
        let dvm = Keys::generate();
        let other = Keys::generate();
        let requester = Keys::generate();
        let content =
            encrypt_tag_list(&requester, &other.public_key(), &[tag(&["i", "hi", "text"])]).unwrap();

        let event = EventBuilder::new(
            Kind::JobRequest(5050),
            content,
            vec![Tag::public_key(other.public_key()), encrypted_marker()],
        )
        .to_event(&requester)
        .unwrap();

        assert!(decrypt_request_tags(event, &dvm).is_err());
    }
}
