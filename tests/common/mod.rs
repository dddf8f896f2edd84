#![allow(dead_code)]

use std::path::{Path, PathBuf};

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries;
use dimse::types::uids;

/// Description of one test object
#[derive(Debug, Clone)]
pub struct Fixture {
    pub patient: &'static str,
    pub study: &'static str,
    pub modality: &'static str,
    pub sop_class: &'static str,
    pub instance: String,
    pub label: Option<&'static str>,
    pub transfer_syntax: &'static str,
}

impl Fixture {
    pub fn new(modality: &'static str, instance: impl Into<String>) -> Self {
        let sop_class = match modality {
            "RTPLAN" => uids::RT_PLAN_STORAGE,
            "RTSTRUCT" => uids::RT_STRUCTURE_SET_STORAGE,
            "RTDOSE" => uids::RT_DOSE_STORAGE,
            _ => uids::CT_IMAGE_STORAGE,
        };
        Self {
            patient: "PAT001",
            study: "1.2.826.0.1.3680043.2.1125.1",
            modality,
            sop_class,
            instance: instance.into(),
            label: None,
            transfer_syntax: uids::EXPLICIT_VR_LITTLE_ENDIAN,
        }
    }

    pub fn label(mut self, label: &'static str) -> Self {
        self.label = Some(label);
        self
    }

    pub fn patient(mut self, patient: &'static str) -> Self {
        self.patient = patient;
        self
    }

    /// Data set bytes in the fixture's transfer syntax
    pub fn dataset(&self) -> Vec<u8> {
        let mut elements = vec![
            DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(self.sop_class)),
            DataElement::new(
                tags::SOP_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from(self.instance.as_str()),
            ),
            DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from(self.patient)),
            DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from(self.study)),
            DataElement::new(
                tags::SERIES_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from(format!("{}.{}", self.study, self.modality.len())),
            ),
            DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from(self.modality)),
        ];
        if let Some(label) = self.label {
            elements.push(DataElement::new(tags::RT_PLAN_LABEL, VR::SH, PrimitiveValue::from(label)));
        }

        let ts = match self.transfer_syntax {
            uids::IMPLICIT_VR_LITTLE_ENDIAN => entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
            _ => entries::EXPLICIT_VR_LITTLE_ENDIAN.erased(),
        };
        let mut out = Vec::new();
        InMemDicomObject::from_element_iter(elements)
            .write_dataset_with_ts(&mut out, &ts)
            .expect("dataset encodes");
        out
    }

    /// Complete Part 10 file
    pub fn part10(&self) -> Vec<u8> {
        dimse::part10::encode(&self.dataset(), self.sop_class, &self.instance, self.transfer_syntax)
            .expect("part 10 encodes")
    }

    pub fn write_to(&self, dir: &Path, name: &str) -> PathBuf {
        std::fs::create_dir_all(dir).expect("create fixture dir");
        let path = dir.join(name);
        std::fs::write(&path, self.part10()).expect("write fixture");
        path
    }
}

/// A typical plan: CT, structure set, plan and dose
pub fn plan_set(prefix: &str, label: &'static str) -> Vec<Fixture> {
    vec![
        Fixture::new("CT", format!("{}.1", prefix)),
        Fixture::new("RTSTRUCT", format!("{}.2", prefix)),
        Fixture::new("RTPLAN", format!("{}.3", prefix)).label(label),
        Fixture::new("RTDOSE", format!("{}.4", prefix)),
    ]
}

/// Relay listening on an ephemeral loopback port, trusting `trusted` and
/// forwarding everything from them to `dest` (when given)
pub fn relay_config(
    storage: &Path,
    trusted: &[&str],
    dest: Option<u16>,
) -> rtrelay::config::Config {
    use rtrelay::models::{Node, Rule};
    use rtrelay::trust::TrustEntry;

    let mut config = rtrelay::config::Config::default();
    config.relay.bind_addr = "127.0.0.1".parse().expect("loopback");
    config.relay.port = 0;
    config.relay.storage_dir = storage.to_path_buf();
    config.relay.association_timeout_ms = 5_000;
    config.relay.dimse_timeout_ms = 5_000;
    config.sender.heartbeat_interval_secs = 0;
    config.trust = trusted
        .iter()
        .map(|ae| TrustEntry {
            ae_title: ae.to_string(),
            allowed: true,
            directory: None,
        })
        .collect();

    if let Some(port) = dest {
        config.nodes.push(Node {
            name: "dest".into(),
            enabled: true,
            ae_title: "DEST".into(),
            calling_ae_title: None,
            host: "127.0.0.1".into(),
            port,
        });
        for ae in trusted {
            config.forwarding.rules.push(Rule {
                name: format!("from-{}", ae.to_ascii_lowercase()),
                enabled: true,
                source_ae: ae.to_string(),
                plan_label_match: String::new(),
                targets: vec!["dest".into()],
            });
        }
    }
    config
}

/// Send fixtures to `port` over one association as `calling_ae`
pub async fn send_all(
    calling_ae: &str,
    port: u16,
    fixtures: &[Fixture],
) -> dimse::Result<Vec<dimse::DimseStatus>> {
    use dimse::scu::ProposedContext;
    use dimse::{DatasetMetadata, DatasetStream, DimseConfig, DimseScu, RemoteNode};

    let scu = DimseScu::new(DimseConfig {
        local_aet: calling_ae.to_string(),
        ..DimseConfig::default()
    });
    let mut contexts: Vec<ProposedContext> = Vec::new();
    for f in fixtures {
        if !contexts.iter().any(|c| c.abstract_syntax == f.sop_class) {
            contexts.push(ProposedContext::new(f.sop_class, vec![f.transfer_syntax.to_string()]));
        }
    }

    let node = RemoteNode::new("RTRELAY", "127.0.0.1", port);
    let mut association = scu.associate(&node, &contexts).await?;
    let mut statuses = Vec::new();
    for f in fixtures {
        let metadata = DatasetMetadata {
            sop_class_uid: Some(f.sop_class.to_string()),
            sop_instance_uid: Some(f.instance.clone()),
            transfer_syntax: Some(f.transfer_syntax.to_string()),
            ..DatasetMetadata::new()
        };
        let stream = DatasetStream::from_bytes(f.dataset().into(), metadata);
        statuses.push(association.store(&stream).await?);
    }
    association.release().await?;
    Ok(statuses)
}
