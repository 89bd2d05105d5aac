//! OMEMO wire payloads
//!
//! Codecs for the three pubsub payloads OMEMO defines: the device list,
//! the per-device key bundle and the `<encrypted>` message element.
//! Publication always uses the legacy namespace; parsing accepts both
//! generations, including both sets of bundle element names.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::element::Element;
use crate::error::{Result, StanzaError};
use crate::ns;

/// One advertised device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceEntry {
    pub id: u32,
    pub label: Option<String>,
}

/// A published device list
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceList {
    pub devices: Vec<DeviceEntry>,
}

impl DeviceList {
    pub fn new(ids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            devices: ids.into_iter().map(|id| DeviceEntry { id, label: None }).collect(),
        }
    }

    pub fn ids(&self) -> Vec<u32> {
        self.devices.iter().map(|d| d.id).collect()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.devices.iter().any(|d| d.id == id)
    }

    /// `<list xmlns="eu.siacs.conversations.axolotl"><device id=…/>…</list>`
    pub fn to_element(&self) -> Element {
        let mut list = Element::new("list").ns(ns::OMEMO_LEGACY);
        for device in &self.devices {
            let mut el = Element::new("device").attr("id", device.id.to_string());
            if let Some(label) = &device.label {
                el = el.attr("label", label);
            }
            list = list.child(el);
        }
        list
    }

    /// Parse a device-list payload under either namespace.
    ///
    /// Children named `device` with a positive integer `id` are kept;
    /// anything else is ignored.
    pub fn parse(element: &Element) -> Result<Self> {
        if element.name() != "list" && element.name() != "devices" {
            return Err(StanzaError::MissingElement("list".to_string()));
        }
        let mut devices = Vec::new();
        for child in element.children_named("device") {
            let Some(id_attr) = child.get_attr("id") else { continue };
            match id_attr.parse::<u32>() {
                Ok(id) if id > 0 => devices.push(DeviceEntry {
                    id,
                    label: child.get_attr("label").map(str::to_string),
                }),
                _ => continue,
            }
        }
        Ok(Self { devices })
    }
}

/// One published one-time pre-key
#[derive(Clone, Debug)]
pub struct PreKeyEntry {
    pub id: u32,
    pub public: Vec<u8>,
}

/// A published key bundle
#[derive(Clone, Debug)]
pub struct DeviceBundle {
    pub identity_key: Vec<u8>,
    pub signed_pre_key_id: u32,
    pub signed_pre_key_public: Vec<u8>,
    pub signed_pre_key_signature: Vec<u8>,
    pub pre_keys: Vec<PreKeyEntry>,
}

impl DeviceBundle {
    /// Bundle element in the legacy publication format
    pub fn to_element(&self) -> Element {
        let mut prekeys = Element::new("prekeys");
        for pk in &self.pre_keys {
            prekeys = prekeys.child(
                Element::new("preKeyPublic")
                    .attr("preKeyId", pk.id.to_string())
                    .text(BASE64.encode(&pk.public)),
            );
        }
        Element::new("bundle")
            .ns(ns::OMEMO_LEGACY)
            .child(
                Element::new("signedPreKeyPublic")
                    .attr("signedPreKeyId", self.signed_pre_key_id.to_string())
                    .text(BASE64.encode(&self.signed_pre_key_public)),
            )
            .child(Element::new("signedPreKeySignature").text(BASE64.encode(&self.signed_pre_key_signature)))
            .child(Element::new("identityKey").text(BASE64.encode(&self.identity_key)))
            .child(prekeys)
    }

    /// Parse a bundle payload.
    ///
    /// Accepts the legacy element names (`signedPreKeyPublic`,
    /// `signedPreKeySignature`, `identityKey`, `preKeyPublic`) and the
    /// newer short ones (`spk`, `spks`, `ik`, `pk`).
    pub fn parse(element: &Element) -> Result<Self> {
        if element.name() != "bundle" {
            return Err(StanzaError::MissingElement("bundle".to_string()));
        }

        let spk = element
            .find_child("signedPreKeyPublic")
            .or_else(|| element.find_child("spk"))
            .ok_or_else(|| StanzaError::MissingElement("signedPreKeyPublic".to_string()))?;
        let signed_pre_key_id = spk
            .get_attr("signedPreKeyId")
            .or_else(|| spk.get_attr("id"))
            .ok_or_else(|| StanzaError::MissingAttribute("signedPreKeyId".to_string()))?
            .parse::<u32>()
            .map_err(|_| StanzaError::InvalidValue {
                field: "signedPreKeyId".to_string(),
                value: spk.get_attr("signedPreKeyId").unwrap_or_default().to_string(),
            })?;
        let signed_pre_key_public = decode_content(spk, "signedPreKeyPublic")?;

        let signature = element
            .find_child("signedPreKeySignature")
            .or_else(|| element.find_child("spks"))
            .ok_or_else(|| StanzaError::MissingElement("signedPreKeySignature".to_string()))?;
        let signed_pre_key_signature = decode_content(signature, "signedPreKeySignature")?;

        let identity = element
            .find_child("identityKey")
            .or_else(|| element.find_child("ik"))
            .ok_or_else(|| StanzaError::MissingElement("identityKey".to_string()))?;
        let identity_key = decode_content(identity, "identityKey")?;

        let mut pre_keys = Vec::new();
        if let Some(prekeys) = element.find_child("prekeys") {
            for child in prekeys.children() {
                if child.name() != "preKeyPublic" && child.name() != "pk" {
                    continue;
                }
                let Some(id_attr) = child.get_attr("preKeyId").or_else(|| child.get_attr("id")) else {
                    continue;
                };
                let Ok(id) = id_attr.parse::<u32>() else { continue };
                let Ok(public) = BASE64.decode(child.content().trim()) else { continue };
                pre_keys.push(PreKeyEntry { id, public });
            }
        }

        Ok(Self {
            identity_key,
            signed_pre_key_id,
            signed_pre_key_public,
            signed_pre_key_signature,
            pre_keys,
        })
    }
}

fn decode_content(element: &Element, field: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(element.content().trim())
        .map_err(|_| StanzaError::InvalidBase64(field.to_string()))
}

/// One `<key>` child of an encrypted header
#[derive(Clone, Debug)]
pub struct KeyElement {
    /// Recipient device id
    pub rid: u32,
    /// Whether this carries a pre-key message
    pub prekey: bool,
    /// The Signal-encrypted key material
    pub data: Vec<u8>,
}

/// The composite `<encrypted>` message element
#[derive(Clone, Debug)]
pub struct EncryptedElement {
    /// Sender device id
    pub sid: u32,
    pub keys: Vec<KeyElement>,
    /// AES-GCM nonce
    pub iv: Vec<u8>,
    /// Ciphertext without the tag; absent for key-transport messages
    pub payload: Option<Vec<u8>>,
}

impl EncryptedElement {
    /// The key element addressed to a given device, if any
    pub fn key_for(&self, device_id: u32) -> Option<&KeyElement> {
        self.keys.iter().find(|k| k.rid == device_id)
    }

    /// Serialize in the legacy publication format
    pub fn to_element(&self) -> Element {
        let mut header = Element::new("header").attr("sid", self.sid.to_string());
        for key in &self.keys {
            let mut el = Element::new("key").attr("rid", key.rid.to_string());
            if key.prekey {
                el = el.attr("prekey", "true");
            }
            header = header.child(el.text(BASE64.encode(&key.data)));
        }
        header = header.child(Element::new("iv").text(BASE64.encode(&self.iv)));

        let mut encrypted = Element::new("encrypted").ns(ns::OMEMO_LEGACY).child(header);
        if let Some(payload) = &self.payload {
            encrypted = encrypted.child(Element::new("payload").text(BASE64.encode(payload)));
        }
        encrypted
    }

    /// Parse an `<encrypted>` element under either namespace.
    ///
    /// The pre-key flag is read from `prekey` (legacy) or `kex` (current),
    /// accepting `true` and `1`.
    pub fn parse(element: &Element) -> Result<Self> {
        let header = element
            .find_child("header")
            .ok_or_else(|| StanzaError::MissingElement("header".to_string()))?;
        let sid = header
            .req_attr("sid")?
            .parse::<u32>()
            .map_err(|_| StanzaError::InvalidValue {
                field: "sid".to_string(),
                value: header.get_attr("sid").unwrap_or_default().to_string(),
            })?;

        let iv_el = header
            .find_child("iv")
            .ok_or_else(|| StanzaError::MissingElement("iv".to_string()))?;
        let iv = decode_content(iv_el, "iv")?;

        let mut keys = Vec::new();
        for key in header.children_named("key") {
            let Some(rid_attr) = key.get_attr("rid") else { continue };
            let Ok(rid) = rid_attr.parse::<u32>() else { continue };
            let prekey = key
                .get_attr("prekey")
                .or_else(|| key.get_attr("kex"))
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false);
            let Ok(data) = BASE64.decode(key.content().trim()) else { continue };
            keys.push(KeyElement { rid, prekey, data });
        }

        let payload = match element.find_child("payload") {
            Some(el) => Some(decode_content(el, "payload")?),
            None => None,
        };

        Ok(Self { sid, keys, iv, payload })
    }
}

/// The `<encrypted>` child of a message stanza under either namespace
pub fn find_encrypted(stanza: &Element) -> Option<&Element> {
    stanza.find_child_in("encrypted", &ns::OMEMO_ALL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_list_roundtrip() {
        let list = DeviceList {
            devices: vec![
                DeviceEntry { id: 42, label: None },
                DeviceEntry { id: 99, label: Some("desk".to_string()) },
            ],
        };
        let el = list.to_element();
        let parsed = DeviceList::parse(&el).unwrap();
        assert_eq!(parsed, list);
    }

    #[test]
    fn test_device_list_skips_bad_ids() {
        let xml = format!(
            "<list xmlns=\"{}\"><device id=\"42\"/><device id=\"0\"/>\
             <device id=\"nope\"/><device/></list>",
            ns::OMEMO_LEGACY
        );
        let parsed = DeviceList::parse(&Element::parse(&xml).unwrap()).unwrap();
        assert_eq!(parsed.ids(), vec![42]);
    }

    #[test]
    fn test_device_list_modern_shape() {
        let xml = format!(
            "<devices xmlns=\"{}\"><device id=\"7\" label=\"phone\"/></devices>",
            ns::OMEMO_2
        );
        let parsed = DeviceList::parse(&Element::parse(&xml).unwrap()).unwrap();
        assert_eq!(parsed.ids(), vec![7]);
        assert_eq!(parsed.devices[0].label.as_deref(), Some("phone"));
    }

    fn sample_bundle() -> DeviceBundle {
        DeviceBundle {
            identity_key: vec![1; 32],
            signed_pre_key_id: 117,
            signed_pre_key_public: vec![2; 32],
            signed_pre_key_signature: vec![3; 64],
            pre_keys: vec![
                PreKeyEntry { id: 1, public: vec![4; 32] },
                PreKeyEntry { id: 2, public: vec![5; 32] },
            ],
        }
    }

    #[test]
    fn test_bundle_roundtrip() {
        let bundle = sample_bundle();
        let parsed = DeviceBundle::parse(&bundle.to_element()).unwrap();
        assert_eq!(parsed.identity_key, bundle.identity_key);
        assert_eq!(parsed.signed_pre_key_id, bundle.signed_pre_key_id);
        assert_eq!(parsed.pre_keys.len(), 2);
    }

    #[test]
    fn test_bundle_modern_names() {
        let xml = format!(
            "<bundle xmlns=\"{}\"><spk id=\"9\">{}</spk><spks>{}</spks><ik>{}</ik>\
             <prekeys><pk id=\"3\">{}</pk></prekeys></bundle>",
            ns::OMEMO_2,
            BASE64.encode([2u8; 32]),
            BASE64.encode([3u8; 64]),
            BASE64.encode([1u8; 32]),
            BASE64.encode([4u8; 32]),
        );
        let parsed = DeviceBundle::parse(&Element::parse(&xml).unwrap()).unwrap();
        assert_eq!(parsed.signed_pre_key_id, 9);
        assert_eq!(parsed.pre_keys[0].id, 3);
    }

    #[test]
    fn test_encrypted_element_roundtrip() {
        let encrypted = EncryptedElement {
            sid: 100,
            keys: vec![
                KeyElement { rid: 42, prekey: true, data: vec![9; 40] },
                KeyElement { rid: 101, prekey: false, data: vec![8; 40] },
            ],
            iv: vec![7; 12],
            payload: Some(vec![6; 24]),
        };
        let el = encrypted.to_element();
        let xml = el.to_xml();
        assert!(xml.contains("sid=\"100\""));
        assert!(xml.contains("rid=\"42\""));
        assert!(xml.contains("prekey=\"true\""));

        let parsed = EncryptedElement::parse(&Element::parse(&xml).unwrap()).unwrap();
        assert_eq!(parsed.sid, 100);
        assert_eq!(parsed.keys.len(), 2);
        assert!(parsed.key_for(42).unwrap().prekey);
        assert!(!parsed.key_for(101).unwrap().prekey);
        assert_eq!(parsed.iv, vec![7; 12]);
        assert_eq!(parsed.payload, Some(vec![6; 24]));
    }

    #[test]
    fn test_encrypted_kex_attribute() {
        let xml = format!(
            "<encrypted xmlns=\"{}\"><header sid=\"1\">\
             <key rid=\"2\" kex=\"1\">{}</key><iv>{}</iv></header></encrypted>",
            ns::OMEMO_2,
            BASE64.encode([1u8; 8]),
            BASE64.encode([2u8; 12]),
        );
        let parsed = EncryptedElement::parse(&Element::parse(&xml).unwrap()).unwrap();
        assert!(parsed.key_for(2).unwrap().prekey);
        assert!(parsed.payload.is_none());
    }

    #[test]
    fn test_find_encrypted_both_namespaces() {
        for namespace in ns::OMEMO_ALL {
            let xml = format!(
                "<message><encrypted xmlns=\"{}\"><header sid=\"1\"/></encrypted></message>",
                namespace
            );
            let stanza = Element::parse(&xml).unwrap();
            assert!(find_encrypted(&stanza).is_some(), "namespace {namespace}");
        }
    }
}
