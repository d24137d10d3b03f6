use anyhow::anyhow;
use lightning_invoice::Bolt11Invoice;
use nostr::{Event, EventId, JsonUtil, Kind, PublicKey};
use std::str::FromStr;

/// Decoded zap receipt (kind 9735) as seen by the orchestrator.
#[derive(Debug, Clone)]
pub struct ZapReceipt {
    /// Settled amount in sats, taken from the bolt11 tag.
    pub amount_sats: u64,
    /// Event the zap targeted, if any (absent for profile zaps).
    pub zapped_event_id: Option<EventId>,
    /// Zap request author, falling back to the receipt author.
    pub sender: PublicKey,
    pub message: String,
    pub anon: bool,
}

pub fn parse_zap_receipt(event: &Event) -> anyhow::Result<ZapReceipt> {
    if event.kind != Kind::ZapReceipt {
        return Err(anyhow!("not a zap receipt: {}", event.id));
    }

    let mut bolt11 = None;
    let mut zapped_event_id = None;
    let mut request_json = None;
    for tag in event.tags.iter() {
        let vec = tag.as_vec();
        match vec.first().map(|s| s.as_str()) {
            Some("bolt11") => bolt11 = vec.get(1).cloned(),
            Some("e") => zapped_event_id = vec.get(1).and_then(|v| EventId::from_hex(v).ok()),
            Some("description") => request_json = vec.get(1).cloned(),
            _ => {}
        }
    }

    let bolt11 = bolt11.ok_or(anyhow!("zap receipt without bolt11 tag: {}", event.id))?;
    let invoice = Bolt11Invoice::from_str(&bolt11)?;
    let amount_sats = invoice.amount_milli_satoshis().unwrap_or(0) / 1000;

    let (sender, message, anon) = match request_json.and_then(|json| Event::from_json(json).ok()) {
        Some(request) => {
            let anon = request
                .tags
                .iter()
                .any(|t| t.as_vec().first().map(|s| s.as_str()) == Some("anon"));
            (request.pubkey, request.content.clone(), anon)
        }
        None => (event.pubkey, String::new(), false),
    };

    Ok(ZapReceipt {
        amount_sats,
        zapped_event_id,
        sender,
        message,
        anon,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use nostr::{EventBuilder, Keys, Tag, TagKind};

    // 50 sat mainnet invoice
    const BOLT11: &str = "lnbc500n1pnapns2dq68skjqnr90pjjqstwv3ex76tyyqpp54yl0p0ezxl2qasdc0ect5tmxj9rdcxry7paszzdpfa5ka79t4jgscqpcsp5fc7u3hs62lr9d77xkwnjaa4fs2fch99lh96gh40kzgnufq2rvmks9qyysgqxqyz5vqnp4q0vzagw8x7r9eyalw35t0u6syql8rtqf9tejep0z6xrwkqrua5advrzjqv22wafr68wtchd4vzq7mj7zf2uzpv67xsaxcemfzak7wp7p0r29wz2g6uqqt5cqqcqqqqqqqqqqhwqqfqfhue440klc35tlmacewtk6sm3jxvkf8ddcvpggfqf4xj6mny6s7zvjwjqrjy4map9av4t82vtxrqlcqnedlwp67l6zw2x3ctf8a6amgp9v6j74";

    fn custom(name: &str, values: Vec<String>) -> Tag {
        Tag::Generic(TagKind::Custom(name.to_string()), values)
    }

    fn receipt(tags: Vec<Tag>) -> Event {
        let keys = Keys::generate();
        EventBuilder::new(Kind::ZapReceipt, "", tags)
            .to_event(&keys)
            .unwrap()
    }

    #[test]
    fn parses_amount_sender_and_target() {
        let sender = Keys::generate();
        let target = EventId::all_zeros();
        let request = EventBuilder::new(Kind::ZapRequest, "great work", vec![])
            .to_event(&sender)
            .unwrap();

        let event = receipt(vec![
            custom("bolt11", vec![BOLT11.to_string()]),
            Tag::event(target),
            custom("description", vec![request.as_json()]),
        ]);

        let zap = parse_zap_receipt(&event).unwrap();
        assert_eq!(zap.amount_sats, 50);
        assert_eq!(zap.zapped_event_id, Some(target));
        assert_eq!(zap.sender, sender.public_key());
        assert_eq!(zap.message, "great work");
        assert!(!zap.anon);
    }

    #[test]
    fn anon_marker_in_request_is_detected() {
        let sender = Keys::generate();
        let request = EventBuilder::new(
            Kind::ZapRequest,
            "",
            vec![custom("anon", vec!["".to_string()])],
        )
        .to_event(&sender)
        .unwrap();

        let event = receipt(vec![
            custom("bolt11", vec![BOLT11.to_string()]),
            custom("description", vec![request.as_json()]),
        ]);

        let zap = parse_zap_receipt(&event).unwrap();
        assert!(zap.anon);
        assert!(zap.zapped_event_id.is_none());
    }

    #[test]
    fn receipt_without_bolt11_is_rejected() {
        let event = receipt(vec![Tag::event(EventId::all_zeros())]);
        assert!(parse_zap_receipt(&event).is_err());
    }
}
