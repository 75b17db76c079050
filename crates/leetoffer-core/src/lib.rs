//! Core domain model for the LeetOffer compensation dataset.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "leetoffer-core";

/// Name of the offers document, both as a local file and inside the remote store.
pub const DATASET_DOCUMENT: &str = "parsed_comps.json";

/// Name of the checkpoint document.
pub const CHECKPOINT_DOCUMENT: &str = ".leetoffer_metadata.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisaSponsorship {
    Yes,
    No,
}

impl VisaSponsorship {
    /// Lenient parse of free-form model output. Anything other than yes/no is unknown.
    pub fn parse_lenient(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "yes" | "y" | "true" => Some(Self::Yes),
            "no" | "n" | "false" => Some(Self::No),
            _ => None,
        }
    }
}

/// One forum submission as observed from the post source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub title: String,
    pub content: String,
    pub vote_count: i64,
    pub creation_date: DateTime<Utc>,
}

/// Extractor output for one offer, before provenance is attached.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OfferDraft {
    pub company: Option<String>,
    pub role: Option<String>,
    pub yoe: Option<f64>,
    pub base_offer: Option<f64>,
    pub total_offer: Option<f64>,
    pub location: Option<String>,
    pub visa_sponsorship: Option<VisaSponsorship>,
}

impl OfferDraft {
    /// Attach provenance from the originating post.
    pub fn stamp(self, post: &Post) -> Offer {
        Offer {
            company: self.company,
            role: self.role,
            yoe: self.yoe,
            base_offer: self.base_offer,
            total_offer: self.total_offer,
            location: self.location,
            visa_sponsorship: self.visa_sponsorship,
            post_id: post.id.clone(),
            post_title: post.title.clone(),
            post_date: post.creation_date.date_naive(),
            post_timestamp: post.creation_date.timestamp_millis(),
        }
    }
}

/// Persisted compensation record. `None` means the post carried no signal for the field.
///
/// Decoding is lenient so that rows written by older producers survive a rewrite:
/// visa strings are matched case-insensitively, numeric post ids are accepted, and
/// missing provenance falls back to empty values (the date is derived from the
/// timestamp when only that is present).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoredOffer")]
pub struct Offer {
    pub company: Option<String>,
    pub role: Option<String>,
    pub yoe: Option<f64>,
    pub base_offer: Option<f64>,
    pub total_offer: Option<f64>,
    pub location: Option<String>,
    pub visa_sponsorship: Option<VisaSponsorship>,
    pub post_id: String,
    pub post_title: String,
    pub post_date: NaiveDate,
    pub post_timestamp: i64,
}

impl Offer {
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey {
            company: self.company.clone(),
            role: self.role.clone(),
            total_offer: self.total_offer.map(total_offer_bits),
            post_id: self.post_id.clone(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredId {
    Text(String),
    Number(i64),
}

#[derive(Deserialize)]
struct StoredOffer {
    #[serde(default)]
    company: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    yoe: Option<f64>,
    #[serde(default)]
    base_offer: Option<f64>,
    #[serde(default)]
    total_offer: Option<f64>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    visa_sponsorship: Option<String>,
    #[serde(default)]
    post_id: Option<StoredId>,
    #[serde(default)]
    post_title: Option<String>,
    #[serde(default)]
    post_date: Option<String>,
    #[serde(default)]
    post_timestamp: Option<f64>,
}

impl From<StoredOffer> for Offer {
    fn from(row: StoredOffer) -> Self {
        let post_timestamp = row.post_timestamp.filter(|t| t.is_finite()).map(|t| t as i64);
        let post_date = row
            .post_date
            .as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d.get(..10).unwrap_or(d), "%Y-%m-%d").ok())
            .or_else(|| {
                post_timestamp
                    .and_then(DateTime::<Utc>::from_timestamp_millis)
                    .map(|at| at.date_naive())
            })
            .unwrap_or_default();
        Offer {
            company: row.company,
            role: row.role,
            yoe: row.yoe,
            base_offer: row.base_offer,
            total_offer: row.total_offer,
            location: row.location,
            visa_sponsorship: row
                .visa_sponsorship
                .as_deref()
                .and_then(VisaSponsorship::parse_lenient),
            post_id: match row.post_id {
                Some(StoredId::Text(id)) => id,
                Some(StoredId::Number(id)) => id.to_string(),
                None => String::new(),
            },
            post_title: row.post_title.unwrap_or_default(),
            post_date,
            post_timestamp: post_timestamp.unwrap_or_default(),
        }
    }
}

// -0.0 and 0.0 must collapse to the same key.
fn total_offer_bits(value: f64) -> u64 {
    if value == 0.0 {
        0f64.to_bits()
    } else {
        value.to_bits()
    }
}

/// Deduplication key: (company, role, total compensation, source post id).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    company: Option<String>,
    role: Option<String>,
    total_offer: Option<u64>,
    post_id: String,
}

/// Ingestion progress marker shared between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub last_post_id: String,
    /// Epoch milliseconds of the run that wrote this checkpoint.
    pub last_fetch_time: i64,
    #[serde(default)]
    pub total_offers: usize,
}

impl Checkpoint {
    pub fn new(last_post_id: impl Into<String>, at: DateTime<Utc>, total_offers: usize) -> Self {
        Self {
            last_post_id: last_post_id.into(),
            last_fetch_time: at.timestamp_millis(),
            total_offers,
        }
    }

    pub fn last_fetch_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.last_fetch_time)
    }
}
