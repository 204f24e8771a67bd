use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    context_builder::{
        community_context::{build_community_context, CommunityContextBuilderParams},
        context_builder::LocalContextBuilder,
        context_table::{csv_separator, merge_candidate_context, with_in_context_flag, ContextRecords},
        conversation_history::{ConversationHistory, ConversationHistoryContextParams},
        entity_extraction::{map_query_to_entities, EntityVectorStoreKey},
        local_context::{build_covariates_context, build_entity_context, build_relationship_context, get_candidate_context},
        source_context::{build_text_unit_context, count_relationships},
    },
    error::{GraphRagError, Result},
    llm::base::BaseTextEmbedding,
    models::{CommunityReport, Covariate, Entity, Relationship, TextUnit},
    retrieval::{community_reports::get_candidate_communities, text_units::get_candidate_text_units},
    vector_stores::vector_store::VectorStore,
};

const ENTITY_CONTEXT_NAME: &str = "Entities";
const RELATIONSHIP_CONTEXT_NAME: &str = "Relationships";
const TEXT_UNIT_CONTEXT_NAME: &str = "Sources";

// Candidate pool multiplier for the entity similarity search.
const ENTITY_OVERSAMPLE_SCALER: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixedContextBuilderParams {
    pub include_entity_names: Vec<String>,
    pub exclude_entity_names: Vec<String>,
    pub conversation_history_max_turns: Option<usize>,
    pub conversation_history_user_turns_only: bool,
    pub max_tokens: usize,
    pub text_unit_prop: f32,
    pub community_prop: f32,
    pub top_k_mapped_entities: usize,
    pub top_k_relationships: usize,
    pub include_community_rank: bool,
    pub include_entity_rank: bool,
    pub rank_description: String,
    pub include_relationship_weight: bool,
    pub relationship_ranking_attribute: String,
    /// Return every candidate record tagged with `in_context`, not only what fit.
    pub return_candidate_context: bool,
    pub use_community_summary: bool,
    pub min_community_rank: f64,
    pub community_context_name: String,
    pub column_delimiter: String,
}

impl Default for MixedContextBuilderParams {
    fn default() -> Self {
        MixedContextBuilderParams {
            include_entity_names: Vec::new(),
            exclude_entity_names: Vec::new(),
            conversation_history_max_turns: Some(5),
            conversation_history_user_turns_only: true,
            max_tokens: 8000,
            text_unit_prop: 0.5,
            community_prop: 0.25,
            top_k_mapped_entities: 10,
            top_k_relationships: 10,
            include_community_rank: false,
            include_entity_rank: false,
            rank_description: "number of relationships".to_string(),
            include_relationship_weight: false,
            relationship_ranking_attribute: "rank".to_string(),
            return_candidate_context: false,
            use_community_summary: false,
            min_community_rank: 0.0,
            community_context_name: "Reports".to_string(),
            column_delimiter: "|".to_string(),
        }
    }
}

impl MixedContextBuilderParams {
    pub fn validate(&self) -> Result<()> {
        if self.community_prop < 0.0 || self.text_unit_prop < 0.0 {
            return Err(GraphRagError::config(
                "community_prop and text_unit_prop must not be negative",
            ));
        }
        if self.community_prop + self.text_unit_prop > 1.0 {
            return Err(GraphRagError::config(
                "The sum of community_prop and text_unit_prop must be less than or equal to 1.0",
            ));
        }
        if self.max_tokens == 0 {
            return Err(GraphRagError::config("max_tokens for local context must be greater than 0"));
        }
        csv_separator(&self.column_delimiter)?;
        Ok(())
    }

    fn local_prop(&self) -> f32 {
        (1.0 - self.community_prop - self.text_unit_prop).max(0.0)
    }
}

fn token_share(max_tokens: usize, prop: f32) -> usize {
    (max_tokens as f32 * prop) as usize
}

/// Local search context mixing community reports, entities, relationships, covariates and source texts.
pub struct LocalSearchMixedContext {
    entities: Vec<Entity>,
    entity_text_embeddings: Box<dyn VectorStore>,
    text_embedder: Arc<dyn BaseTextEmbedding>,
    text_units: Vec<TextUnit>,
    text_unit_index: HashMap<String, usize>,
    community_reports: Vec<CommunityReport>,
    community_report_index: HashMap<String, usize>,
    relationships: Vec<Relationship>,
    covariates: BTreeMap<String, Vec<Covariate>>,
    num_tokens_fn: fn(&str) -> usize,
    embedding_vectorstore_key: EntityVectorStoreKey,
}

impl LocalSearchMixedContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        entities: Vec<Entity>,
        entity_text_embeddings: Box<dyn VectorStore>,
        text_embedder: Arc<dyn BaseTextEmbedding>,
        text_units: Option<Vec<TextUnit>>,
        community_reports: Option<Vec<CommunityReport>>,
        relationships: Option<Vec<Relationship>>,
        covariates: Option<BTreeMap<String, Vec<Covariate>>>,
        num_tokens_fn: fn(&str) -> usize,
        embedding_vectorstore_key: EntityVectorStoreKey,
    ) -> Self {
        let text_units = text_units.unwrap_or_default();
        let text_unit_index = text_units
            .iter()
            .enumerate()
            .map(|(index, unit)| (unit.id.clone(), index))
            .collect();

        let community_reports = community_reports.unwrap_or_default();
        let community_report_index = community_reports
            .iter()
            .enumerate()
            .map(|(index, report)| (report.community_id.clone(), index))
            .collect();

        LocalSearchMixedContext {
            entities,
            entity_text_embeddings,
            text_embedder,
            text_units,
            text_unit_index,
            community_reports,
            community_report_index,
            relationships: relationships.unwrap_or_default(),
            covariates: covariates.unwrap_or_default(),
            num_tokens_fn,
            embedding_vectorstore_key,
        }
    }

    /// Reports of the communities the selected entities belong to, best matched first, in a single batch.
    fn build_community_section(
        &self,
        selected_entities: &[Entity],
        max_tokens: usize,
        params: &MixedContextBuilderParams,
    ) -> Result<(String, ContextRecords)> {
        if selected_entities.is_empty() || self.community_reports.is_empty() || max_tokens == 0 {
            return Ok((String::new(), ContextRecords::new()));
        }

        let mut community_matches: Vec<(&str, usize)> = Vec::new();
        for community_id in selected_entities
            .iter()
            .filter_map(|entity| entity.community_ids.as_ref())
            .flatten()
        {
            match community_matches.iter_mut().find(|(id, _)| *id == community_id.as_str()) {
                Some((_, matches)) => *matches += 1,
                None => community_matches.push((community_id.as_str(), 1)),
            }
        }

        let mut selected_communities: Vec<(&CommunityReport, usize)> = community_matches
            .into_iter()
            .filter_map(|(community_id, matches)| {
                self.community_report_index
                    .get(community_id)
                    .map(|&index| (&self.community_reports[index], matches))
            })
            .collect();

        selected_communities.sort_by(|a, b| {
            b.1.cmp(&a.1).then(
                b.0.rank
                    .unwrap_or_default()
                    .partial_cmp(&a.0.rank.unwrap_or_default())
                    .unwrap_or(Ordering::Equal),
            )
        });

        let selected_reports: Vec<CommunityReport> = selected_communities
            .into_iter()
            .map(|(report, _)| report.clone())
            .collect();

        let community_params = CommunityContextBuilderParams {
            use_community_summary: params.use_community_summary,
            column_delimiter: params.column_delimiter.clone(),
            shuffle_data: false,
            include_community_rank: params.include_community_rank,
            min_community_rank: params.min_community_rank,
            max_tokens,
            single_batch: true,
            context_name: params.community_context_name.clone(),
            ..Default::default()
        };

        let (context_chunks, mut context_records) =
            build_community_context(&selected_reports, None, self.num_tokens_fn, &community_params, 0)?;

        if params.return_candidate_context {
            let candidates = get_candidate_communities(
                selected_entities,
                &self.community_reports,
                params.include_community_rank,
                params.use_community_summary,
            )?;
            merge_candidate_context(
                &mut context_records,
                ContextRecords::from([(params.community_context_name.to_lowercase(), candidates)]),
            )?;
        }

        Ok((context_chunks.join("\n\n"), context_records))
    }

    /// Entity table, then relationships and covariates for a growing prefix of the selected entities.
    ///
    /// The prefix stops growing at the first step whose total exceeds `max_tokens`; that step is discarded.
    fn build_local_section(
        &self,
        selected_entities: &[Entity],
        max_tokens: usize,
        params: &MixedContextBuilderParams,
    ) -> Result<(String, ContextRecords)> {
        let (entity_context, entity_table) = build_entity_context(
            selected_entities,
            self.num_tokens_fn,
            max_tokens,
            params.include_entity_rank,
            &params.rank_description,
            &params.column_delimiter,
            ENTITY_CONTEXT_NAME,
        )?;
        if entity_table.height() < selected_entities.len() {
            warn!(
                "Entity context reached the token limit, {} of {} entities rendered",
                entity_table.height(),
                selected_entities.len()
            );
        }
        let entity_tokens = (self.num_tokens_fn)(&entity_context);

        let mut final_context: Vec<String> = Vec::new();
        let mut final_context_records = ContextRecords::new();

        for added in 1..=selected_entities.len() {
            let added_entities = &selected_entities[..added];
            let mut current_context = Vec::new();
            let mut current_context_records = ContextRecords::new();

            let (relationship_context, relationship_table) = build_relationship_context(
                added_entities,
                &self.relationships,
                self.num_tokens_fn,
                params.include_relationship_weight,
                max_tokens,
                params.top_k_relationships,
                &params.relationship_ranking_attribute,
                &params.column_delimiter,
                RELATIONSHIP_CONTEXT_NAME,
            )?;
            let mut total_tokens = entity_tokens + (self.num_tokens_fn)(&relationship_context);
            if relationship_table.height() > 0 {
                current_context.push(relationship_context);
                current_context_records.insert(RELATIONSHIP_CONTEXT_NAME.to_lowercase(), relationship_table);
            }

            for (covariate_type, covariates) in &self.covariates {
                let (covariate_context, covariate_table) = build_covariates_context(
                    added_entities,
                    covariates,
                    self.num_tokens_fn,
                    max_tokens,
                    &params.column_delimiter,
                    covariate_type,
                )?;
                total_tokens += (self.num_tokens_fn)(&covariate_context);
                if covariate_table.height() > 0 {
                    current_context.push(covariate_context);
                    current_context_records.insert(covariate_type.to_lowercase(), covariate_table);
                }
            }

            if total_tokens > max_tokens {
                warn!(
                    "Reached token limit after {} entities, reverting to previous context state",
                    added - 1
                );
                break;
            }

            final_context = current_context;
            final_context_records = current_context_records;
        }

        let mut sections = Vec::new();
        if entity_table.height() > 0 {
            sections.push(entity_context);
            final_context_records.insert(ENTITY_CONTEXT_NAME.to_lowercase(), entity_table);
        }
        sections.extend(final_context);

        if params.return_candidate_context {
            let candidates = get_candidate_context(
                selected_entities,
                &self.entities,
                &self.relationships,
                &self.covariates,
                params.include_entity_rank,
                &params.rank_description,
                params.include_relationship_weight,
            )?;
            merge_candidate_context(&mut final_context_records, candidates)?;
        } else {
            final_context_records = final_context_records
                .into_iter()
                .map(|(key, record_df)| with_in_context_flag(record_df, true).map(|record_df| (key, record_df)))
                .collect::<Result<ContextRecords>>()?;
        }

        Ok((sections.join("\n\n"), final_context_records))
    }

    /// Source texts of the selected entities, ordered by entity selection order and then by how many of
    /// the entity's relationships each text supports.
    fn build_text_unit_section(
        &self,
        selected_entities: &[Entity],
        max_tokens: usize,
        params: &MixedContextBuilderParams,
    ) -> Result<(String, ContextRecords)> {
        if selected_entities.is_empty() || self.text_units.is_empty() || max_tokens == 0 {
            return Ok((String::new(), ContextRecords::new()));
        }

        let mut text_unit_ids: HashSet<&str> = HashSet::new();
        let mut unit_info_list: Vec<(&TextUnit, usize, usize)> = Vec::new();

        for (index, entity) in selected_entities.iter().enumerate() {
            let entity_relationships: Vec<&Relationship> = self
                .relationships
                .iter()
                .filter(|relationship| relationship.source == entity.title || relationship.target == entity.title)
                .collect();

            for text_id in entity.text_unit_ids.iter().flatten() {
                if text_unit_ids.contains(text_id.as_str()) {
                    continue;
                }
                let Some(&unit_index) = self.text_unit_index.get(text_id) else {
                    continue;
                };

                let selected_unit = &self.text_units[unit_index];
                text_unit_ids.insert(text_id.as_str());
                unit_info_list.push((
                    selected_unit,
                    index,
                    count_relationships(&entity_relationships, selected_unit),
                ));
            }
        }

        unit_info_list.sort_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)));

        let selected_text_units: Vec<TextUnit> = unit_info_list.into_iter().map(|(unit, _, _)| unit.clone()).collect();

        let (context_text, mut context_records) = build_text_unit_context(
            &selected_text_units,
            self.num_tokens_fn,
            &params.column_delimiter,
            false,
            max_tokens,
            TEXT_UNIT_CONTEXT_NAME,
            0,
        )?;

        if params.return_candidate_context {
            let candidates = get_candidate_text_units(selected_entities, &self.text_units)?;
            merge_candidate_context(
                &mut context_records,
                ContextRecords::from([(TEXT_UNIT_CONTEXT_NAME.to_lowercase(), candidates)]),
            )?;
        }

        Ok((context_text, context_records))
    }
}

#[async_trait]
impl LocalContextBuilder for LocalSearchMixedContext {
    async fn build_context(
        &self,
        query: &str,
        conversation_history: Option<&ConversationHistory>,
        context_builder_params: &MixedContextBuilderParams,
    ) -> Result<(String, ContextRecords)> {
        let params = context_builder_params;
        params.validate()?;

        // Earlier user questions help map follow-up queries to the right entities.
        let mut entity_query = query.to_string();
        if let Some(conversation_history) = conversation_history {
            let pre_user_questions = conversation_history.get_user_turns(params.conversation_history_max_turns);
            if !pre_user_questions.is_empty() {
                entity_query = format!("{}\n{}", entity_query, pre_user_questions.join("\n"));
            }
        }

        let selected_entities = map_query_to_entities(
            &entity_query,
            self.entity_text_embeddings.as_ref(),
            self.text_embedder.as_ref(),
            &self.entities,
            self.embedding_vectorstore_key,
            &params.include_entity_names,
            &params.exclude_entity_names,
            params.top_k_mapped_entities,
            ENTITY_OVERSAMPLE_SCALER,
        )
        .await?;

        debug!("Selected {} entities for the local context", selected_entities.len());

        let mut final_context: Vec<String> = Vec::new();
        let mut final_context_records = ContextRecords::new();
        let mut max_tokens = params.max_tokens;

        if let Some(conversation_history) = conversation_history {
            let history_params = ConversationHistoryContextParams {
                include_user_turns_only: params.conversation_history_user_turns_only,
                max_qa_turns: params.conversation_history_max_turns,
                max_tokens,
                recency_bias: false,
                column_delimiter: params.column_delimiter.clone(),
                ..Default::default()
            };
            let (history_context, history_records) =
                conversation_history.build_context(self.num_tokens_fn, &history_params)?;
            if !history_context.trim().is_empty() {
                max_tokens = max_tokens.saturating_sub((self.num_tokens_fn)(&history_context));
                final_context.push(history_context);
                final_context_records.extend(history_records);
            }
        }

        let sections = [
            self.build_community_section(
                &selected_entities,
                token_share(max_tokens, params.community_prop),
                params,
            )?,
            self.build_local_section(&selected_entities, token_share(max_tokens, params.local_prop()), params)?,
            self.build_text_unit_section(
                &selected_entities,
                token_share(max_tokens, params.text_unit_prop),
                params,
            )?,
        ];

        for (context_text, context_records) in sections {
            if !context_text.trim().is_empty() {
                final_context.push(context_text);
            }
            final_context_records.extend(context_records);
        }

        Ok((final_context.join("\n\n"), final_context_records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context_builder::{
            context_table::{column_values, IN_CONTEXT_COLUMN},
            conversation_history::ConversationRole,
        },
        vector_stores::{in_memory::InMemoryVectorStore, vector_store::VectorStoreDocument},
    };

    struct ConstantEmbedding;

    #[async_trait]
    impl BaseTextEmbedding for ConstantEmbedding {
        async fn aembed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }
    }

    fn word_count(text: &str) -> usize {
        text.split_whitespace().count()
    }

    fn entity(id: &str, title: &str) -> Entity {
        Entity {
            id: id.to_string(),
            short_id: Some(id.to_string()),
            title: title.to_string(),
            description: Some(format!("about {}", title.to_lowercase())),
            ..Default::default()
        }
    }

    async fn entity_store(entities: &[Entity]) -> Box<dyn VectorStore> {
        let mut store = InMemoryVectorStore::new();
        let documents = entities
            .iter()
            .enumerate()
            .map(|(index, entity)| VectorStoreDocument {
                id: entity.id.clone(),
                text: entity.description.clone(),
                vector: Some(vec![1.0, index as f32]),
                ..Default::default()
            })
            .collect();
        store.load_documents(documents, true).await.unwrap();
        Box::new(store)
    }

    async fn context_for(
        entities: Vec<Entity>,
        relationships: Option<Vec<Relationship>>,
        text_units: Option<Vec<TextUnit>>,
    ) -> LocalSearchMixedContext {
        let store = entity_store(&entities).await;
        LocalSearchMixedContext::new(
            entities,
            store,
            Arc::new(ConstantEmbedding),
            text_units,
            None,
            relationships,
            None,
            word_count,
            EntityVectorStoreKey::Id,
        )
    }

    #[tokio::test]
    async fn proportions_above_one_are_rejected() {
        let context = context_for(vec![entity("e1", "ALICE")], None, None).await;
        let params = MixedContextBuilderParams {
            community_prop: 0.5,
            text_unit_prop: 0.6,
            ..Default::default()
        };

        let result = context.build_context("who is alice", None, &params).await;
        assert!(result.unwrap_err().is_config());
    }

    #[tokio::test]
    async fn single_entity_yields_only_the_entity_table() {
        let context = context_for(vec![entity("e1", "ALICE")], None, None).await;

        let (context_text, context_records) = context
            .build_context("who is alice", None, &MixedContextBuilderParams::default())
            .await
            .unwrap();

        assert_eq!(context_text, "-----Entities-----\nid|entity|description\ne1|ALICE|about alice\n");
        assert_eq!(context_records.len(), 1);
        assert_eq!(
            column_values(&context_records["entities"], IN_CONTEXT_COLUMN).unwrap(),
            vec!["true"]
        );
    }

    #[tokio::test]
    async fn relationships_are_reverted_when_they_overflow() {
        let entities = vec![entity("e1", "ALICE"), entity("e2", "BOB")];
        let relationships = vec![Relationship {
            id: "r1".to_string(),
            short_id: Some("r1".to_string()),
            source: "ALICE".to_string(),
            target: "BOB".to_string(),
            description: Some("alice knows bob very well indeed".to_string()),
            ..Default::default()
        }];
        let context = context_for(entities, Some(relationships), None).await;

        // all of the budget goes to the local section
        let params = MixedContextBuilderParams {
            max_tokens: 12,
            community_prop: 0.0,
            text_unit_prop: 0.0,
            ..Default::default()
        };

        let (context_text, context_records) = context.build_context("alice", None, &params).await.unwrap();

        assert!(context_text.starts_with("-----Entities-----"));
        assert!(!context_text.contains("-----Relationships-----"));
        assert!(!context_records.contains_key("relationships"));
    }

    #[tokio::test]
    async fn text_units_follow_entity_order_and_relationship_count() {
        let mut alice = entity("e1", "ALICE");
        alice.text_unit_ids = Some(vec!["t1".to_string(), "t2".to_string()]);
        let relationships = vec![Relationship {
            id: "r1".to_string(),
            source: "ALICE".to_string(),
            target: "BOB".to_string(),
            text_unit_ids: Some(vec!["t2".to_string()]),
            ..Default::default()
        }];
        let text_units = vec![
            TextUnit {
                id: "t1".to_string(),
                short_id: Some("t1".to_string()),
                text: "first".to_string(),
                ..Default::default()
            },
            TextUnit {
                id: "t2".to_string(),
                short_id: Some("t2".to_string()),
                text: "second".to_string(),
                ..Default::default()
            },
        ];
        let context = context_for(vec![alice], Some(relationships), Some(text_units)).await;

        let (context_text, _) = context
            .build_context("alice", None, &MixedContextBuilderParams::default())
            .await
            .unwrap();

        assert!(context_text.ends_with("-----Sources-----\nid|text\nt2|second\nt1|first\n"));
    }

    #[tokio::test]
    async fn conversation_history_comes_first() {
        let context = context_for(vec![entity("e1", "ALICE")], None, None).await;
        let mut history = ConversationHistory::new();
        history.add_turn(ConversationRole::User, "who is alice");
        history.add_turn(ConversationRole::Assistant, "a person");

        let (context_text, context_records) = context
            .build_context("and her friends?", Some(&history), &MixedContextBuilderParams::default())
            .await
            .unwrap();

        assert_eq!(
            context_text,
            "-----Conversation History-----\nturn|content\nuser|who is alice\n\n\n-----Entities-----\nid|entity|description\ne1|ALICE|about alice\n"
        );
        assert!(context_records.contains_key("conversation history"));
    }
}
