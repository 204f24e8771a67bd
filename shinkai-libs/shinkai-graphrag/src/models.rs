use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Deserializer, Serialize};

pub type Attributes = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(default)]
    pub short_id: Option<String>,
    pub title: String,
    #[serde(default, alias = "type")]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub description_embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub name_embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub graph_embedding: Option<Vec<f32>>,
    #[serde(default, deserialize_with = "deserialize_optional_ids")]
    pub community_ids: Option<Vec<String>>,
    #[serde(default)]
    pub text_unit_ids: Option<Vec<String>>,
    #[serde(default)]
    pub document_ids: Option<Vec<String>>,
    #[serde(default)]
    pub rank: Option<i32>,
    #[serde(default)]
    pub attributes: Attributes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    #[serde(default)]
    pub short_id: Option<String>,
    pub source: String,
    pub target: String,
    #[serde(default = "default_relationship_weight")]
    pub weight: f64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub description_embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub text_unit_ids: Option<Vec<String>>,
    #[serde(default)]
    pub rank: Option<i32>,
    #[serde(default)]
    pub attributes: Attributes,
}

fn default_relationship_weight() -> f64 {
    1.0
}

impl Default for Relationship {
    fn default() -> Self {
        Relationship {
            id: String::new(),
            short_id: None,
            source: String::new(),
            target: String::new(),
            weight: default_relationship_weight(),
            description: None,
            description_embedding: None,
            text_unit_ids: None,
            rank: None,
            attributes: Attributes::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Covariate {
    pub id: String,
    #[serde(default)]
    pub short_id: Option<String>,
    /// Title of the entity the covariate is about.
    pub subject_id: String,
    #[serde(default = "default_subject_type")]
    pub subject_type: String,
    #[serde(default = "default_covariate_type")]
    pub covariate_type: String,
    #[serde(default)]
    pub text_unit_ids: Option<Vec<String>>,
    #[serde(default)]
    pub attributes: Attributes,
}

fn default_subject_type() -> String {
    "entity".to_string()
}

fn default_covariate_type() -> String {
    "claim".to_string()
}

impl Default for Covariate {
    fn default() -> Self {
        Covariate {
            id: String::new(),
            short_id: None,
            subject_id: String::new(),
            subject_type: default_subject_type(),
            covariate_type: default_covariate_type(),
            text_unit_ids: None,
            attributes: Attributes::new(),
        }
    }
}

/// A node of the community hierarchy. `id` is the key used by reports, entity memberships
/// and the `parent`/`children` links.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Community {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub short_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(deserialize_with = "deserialize_id")]
    pub level: String,
    #[serde(default, deserialize_with = "deserialize_parent_id")]
    pub parent: Option<String>,
    #[serde(default, deserialize_with = "deserialize_ids")]
    pub children: Vec<String>,
    #[serde(default)]
    pub entity_ids: Option<Vec<String>>,
    #[serde(default)]
    pub relationship_ids: Option<Vec<String>>,
    #[serde(default)]
    pub covariate_ids: Option<HashMap<String, Vec<String>>>,
    #[serde(default)]
    pub text_unit_ids: Option<Vec<String>>,
    #[serde(default)]
    pub attributes: Attributes,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommunityReport {
    pub id: String,
    #[serde(default)]
    pub short_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(deserialize_with = "deserialize_id")]
    pub community_id: String,
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    pub level: Option<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub full_content: String,
    #[serde(default)]
    pub rank: Option<f64>,
    #[serde(default)]
    pub summary_embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub full_content_embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub attributes: Attributes,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextUnit {
    pub id: String,
    #[serde(default)]
    pub short_id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub entity_ids: Option<Vec<String>>,
    #[serde(default)]
    pub relationship_ids: Option<Vec<String>>,
    #[serde(default)]
    pub covariate_ids: Option<HashMap<String, Vec<String>>>,
    #[serde(default)]
    pub n_tokens: Option<usize>,
    #[serde(default)]
    pub document_ids: Option<Vec<String>>,
    #[serde(default)]
    pub attributes: Attributes,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Integer(i64),
    Float(f64),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Text(text) => text,
            RawId::Integer(value) => value.to_string(),
            // Integral floats ("3.0") come out of some dataframe exports.
            RawId::Float(value) if value.fract() == 0.0 => (value as i64).to_string(),
            RawId::Float(value) => value.to_string(),
        }
    }
}

fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    RawId::deserialize(deserializer).map(String::from)
}

fn deserialize_optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<RawId>::deserialize(deserializer)?.map(String::from))
}

fn deserialize_parent_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let parent = deserialize_optional_id(deserializer)?;
    Ok(parent.filter(|id| !id.is_empty() && id != "-1"))
}

fn deserialize_ids<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(deserialize_optional_ids(deserializer)?.unwrap_or_default())
}

fn deserialize_optional_ids<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let ids = Option::<Vec<RawId>>::deserialize(deserializer)?;
    Ok(ids.map(|ids| ids.into_iter().map(String::from).collect()))
}
