use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Instant,
};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{GraphRagError, Result},
    llm::base::{BaseLLM, LLMParams},
    models::{Community, CommunityReport},
    search::global_search::prompts::RATE_QUERY,
};

use super::rate_relevancy::rate_relevancy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicCommunitySelectionParams {
    pub rate_query: String,
    /// Rate report summaries instead of full reports.
    pub use_summary: bool,
    /// A community is relevant when its rating is strictly above this value.
    pub threshold: u32,
    pub keep_parent: bool,
    pub num_repeats: usize,
    pub max_level: usize,
    pub concurrent_coroutines: usize,
    pub llm_params: LLMParams,
}

impl Default for DynamicCommunitySelectionParams {
    fn default() -> Self {
        DynamicCommunitySelectionParams {
            rate_query: RATE_QUERY.to_string(),
            use_summary: false,
            threshold: 1,
            keep_parent: false,
            num_repeats: 1,
            max_level: 2,
            concurrent_coroutines: 8,
            llm_params: LLMParams {
                json: true,
                ..Default::default()
            },
        }
    }
}

impl DynamicCommunitySelectionParams {
    pub fn validate(&self) -> Result<()> {
        if self.concurrent_coroutines == 0 {
            return Err(GraphRagError::config(
                "concurrent_coroutines for dynamic community selection must be greater than 0",
            ));
        }
        if self.num_repeats == 0 {
            return Err(GraphRagError::config("num_repeats must be greater than 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommunitySelection {
    pub reports: Vec<CommunityReport>,
    /// Rating of every community that was rated, keyed by community id.
    pub ratings: HashMap<String, u32>,
    pub llm_calls: usize,
    pub prompt_tokens: usize,
    pub output_tokens: usize,
}

/// Walks the community tree from the roots, descending only into communities the LLM rates as relevant.
pub struct DynamicCommunitySelection {
    reports: HashMap<String, CommunityReport>,
    children: HashMap<String, Vec<String>>,
    parents: HashMap<String, String>,
    levels: BTreeMap<usize, Vec<String>>,
    llm: Arc<dyn BaseLLM>,
    num_tokens_fn: fn(&str) -> usize,
    params: DynamicCommunitySelectionParams,
    semaphore: Semaphore,
}

impl DynamicCommunitySelection {
    pub fn new(
        community_reports: Vec<CommunityReport>,
        communities: Vec<Community>,
        llm: Arc<dyn BaseLLM>,
        num_tokens_fn: fn(&str) -> usize,
        params: DynamicCommunitySelectionParams,
    ) -> Result<Self> {
        params.validate()?;

        let reports: HashMap<String, CommunityReport> = community_reports
            .into_iter()
            .map(|report| (report.community_id.clone(), report))
            .collect();

        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        let mut parents: HashMap<String, String> = HashMap::new();
        let mut levels: BTreeMap<usize, Vec<String>> = BTreeMap::new();

        for community in &communities {
            let community_children = children.entry(community.id.clone()).or_default();
            for child in &community.children {
                if !community_children.contains(child) {
                    community_children.push(child.clone());
                }
            }
        }

        for community in &communities {
            if let Some(parent) = &community.parent {
                parents.insert(community.id.clone(), parent.clone());
                let siblings = children.entry(parent.clone()).or_default();
                if !siblings.contains(&community.id) {
                    siblings.push(community.id.clone());
                }
            }

            match community.level.parse::<usize>() {
                Ok(level) => {
                    if reports.contains_key(&community.id) {
                        levels.entry(level).or_default().push(community.id.clone());
                    }
                }
                Err(_) => warn!("Community {} has a non numeric level: {}", community.id, community.level),
            }
        }

        let semaphore = Semaphore::new(params.concurrent_coroutines);

        Ok(DynamicCommunitySelection {
            reports,
            children,
            parents,
            levels,
            llm,
            num_tokens_fn,
            params,
            semaphore,
        })
    }

    fn describe(&self, community_id: &str) -> &str {
        match self.reports.get(community_id) {
            Some(report) if self.params.use_summary => &report.summary,
            Some(report) => &report.full_content,
            None => "",
        }
    }

    /// Rates the tree level by level. Ratings of one level all resolve before the next level starts.
    pub async fn select(&self, query: &str, cancellation_token: &CancellationToken) -> Result<CommunitySelection> {
        let start_time = Instant::now();
        let mut selection = CommunitySelection::default();

        let mut queue: Vec<String> = self.levels.get(&0).cloned().unwrap_or_default();
        let mut relevant_communities: Vec<String> = Vec::new();
        let mut level = 0;

        if queue.is_empty() {
            warn!("No root communities with reports to start dynamic selection from");
        }

        while !queue.is_empty() {
            let results = join_all(queue.iter().map(|community_id| {
                rate_relevancy(
                    query,
                    self.describe(community_id),
                    self.llm.as_ref(),
                    self.num_tokens_fn,
                    &self.params.rate_query,
                    self.params.num_repeats,
                    &self.params.llm_params,
                    &self.semaphore,
                    cancellation_token,
                )
            }))
            .await;

            let mut enqueued: HashSet<String> = HashSet::new();
            let mut communities_to_rate: Vec<String> = Vec::new();

            for (community_id, result) in queue.iter().zip(results) {
                let result = result?;
                selection.ratings.insert(community_id.clone(), result.rating);
                selection.llm_calls += result.llm_calls;
                selection.prompt_tokens += result.prompt_tokens;
                selection.output_tokens += result.output_tokens;

                if result.rating <= self.params.threshold {
                    continue;
                }

                if !relevant_communities.contains(community_id) {
                    relevant_communities.push(community_id.clone());
                }

                for child in self.children.get(community_id).into_iter().flatten() {
                    if !self.reports.contains_key(child) {
                        debug!("Dynamic community selection: cannot find community {} in reports", child);
                        continue;
                    }
                    if !selection.ratings.contains_key(child) && enqueued.insert(child.clone()) {
                        communities_to_rate.push(child.clone());
                    }
                }

                if !self.params.keep_parent {
                    if let Some(parent) = self.parents.get(community_id) {
                        relevant_communities.retain(|id| id != parent);
                    }
                }
            }

            queue = communities_to_rate;
            level += 1;

            if level > self.params.max_level {
                break;
            }

            if queue.is_empty() && relevant_communities.is_empty() {
                if let Some(next_level) = self.levels.get(&level) {
                    info!(
                        "Dynamic community selection: no relevant community reports, adding all reports at level {} to rate",
                        level
                    );
                    queue = next_level
                        .iter()
                        .filter(|id| !selection.ratings.contains_key(*id))
                        .cloned()
                        .collect();
                }
            }
        }

        selection.reports = relevant_communities
            .iter()
            .filter_map(|community_id| self.reports.get(community_id).cloned())
            .collect();

        info!(
            "Dynamic community selection (took: {}s)\nrating distribution {:?}\n{} out of {} community reports are relevant\nprompt tokens: {}, output tokens: {}",
            start_time.elapsed().as_secs(),
            rating_distribution(&selection.ratings),
            selection.reports.len(),
            self.reports.len(),
            selection.prompt_tokens,
            selection.output_tokens
        );

        Ok(selection)
    }
}

fn rating_distribution(ratings: &HashMap<String, u32>) -> BTreeMap<u32, usize> {
    let mut distribution = BTreeMap::new();
    for rating in ratings.values() {
        *distribution.entry(*rating).or_default() += 1;
    }
    distribution
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::llm::base::{ChatMessage, GlobalSearchPhase, LLMResponse};

    /// Rates a report by looking up its content.
    struct RatingOracle {
        ratings: HashMap<String, u32>,
        calls: AtomicUsize,
    }

    impl RatingOracle {
        fn new(ratings: &[(&str, u32)]) -> Arc<Self> {
            Arc::new(RatingOracle {
                ratings: ratings.iter().map(|(id, rating)| (id.to_string(), *rating)).collect(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl BaseLLM for RatingOracle {
        fn model_name(&self) -> &str {
            "oracle"
        }

        async fn agenerate(
            &self,
            messages: Vec<ChatMessage>,
            _llm_params: LLMParams,
            _search_phase: Option<GlobalSearchPhase>,
        ) -> anyhow::Result<LLMResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let rating = self.ratings.get(&messages[0].content).copied().unwrap_or(1);
            Ok(LLMResponse::new(format!("{{\"rating\": {}}}", rating)))
        }
    }

    fn community(id: &str, level: &str, parent: Option<&str>, children: &[&str]) -> Community {
        Community {
            id: id.to_string(),
            title: format!("Community {}", id),
            level: level.to_string(),
            parent: parent.map(|p| p.to_string()),
            children: children.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    fn report(community_id: &str) -> CommunityReport {
        CommunityReport {
            id: format!("report-{}", community_id),
            community_id: community_id.to_string(),
            full_content: community_id.to_string(),
            rank: Some(1.0),
            ..Default::default()
        }
    }

    fn params() -> DynamicCommunitySelectionParams {
        DynamicCommunitySelectionParams {
            rate_query: "{description}".to_string(),
            ..Default::default()
        }
    }

    fn word_count(text: &str) -> usize {
        text.split_whitespace().count()
    }

    fn selection(
        oracle: Arc<RatingOracle>,
        communities: Vec<Community>,
        params: DynamicCommunitySelectionParams,
    ) -> DynamicCommunitySelection {
        let reports = communities.iter().map(|community| report(&community.id)).collect();
        DynamicCommunitySelection::new(reports, communities, oracle, word_count, params).unwrap()
    }

    fn tree() -> Vec<Community> {
        vec![
            community("A", "0", None, &["B", "C"]),
            community("B", "1", Some("A"), &[]),
            community("C", "1", Some("A"), &[]),
        ]
    }

    fn selected_ids(selection: &CommunitySelection) -> Vec<&str> {
        let mut ids: Vec<&str> = selection.reports.iter().map(|r| r.community_id.as_str()).collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn relevant_child_evicts_its_parent() {
        let oracle = RatingOracle::new(&[("A", 3), ("B", 1), ("C", 4)]);
        let selector = selection(oracle.clone(), tree(), params());

        let result = selector.select("query", &CancellationToken::new()).await.unwrap();

        assert_eq!(selected_ids(&result), vec!["C"]);
        assert_eq!(result.ratings.len(), 3);
        assert_eq!(result.llm_calls, 3);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn keep_parent_retains_ancestors() {
        let oracle = RatingOracle::new(&[("A", 3), ("B", 1), ("C", 4)]);
        let params = DynamicCommunitySelectionParams {
            keep_parent: true,
            ..params()
        };
        let selector = selection(oracle, tree(), params);

        let result = selector.select("query", &CancellationToken::new()).await.unwrap();
        assert_eq!(selected_ids(&result), vec!["A", "C"]);
    }

    #[tokio::test]
    async fn selection_is_repeatable() {
        let oracle = RatingOracle::new(&[("A", 3), ("B", 5), ("C", 4)]);
        let selector = selection(oracle, tree(), params());

        let first = selector.select("query", &CancellationToken::new()).await.unwrap();
        let second = selector.select("query", &CancellationToken::new()).await.unwrap();
        assert_eq!(selected_ids(&first), selected_ids(&second));
        assert_eq!(selected_ids(&first), vec!["B", "C"]);
    }

    #[tokio::test]
    async fn irrelevant_roots_fall_back_to_next_level() {
        let oracle = RatingOracle::new(&[("A", 1), ("B", 2), ("C", 1)]);
        let selector = selection(oracle.clone(), tree(), params());

        let result = selector.select("query", &CancellationToken::new()).await.unwrap();
        assert_eq!(selected_ids(&result), vec!["B"]);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn max_level_stops_descent() {
        let communities = vec![
            community("A", "0", None, &["B"]),
            community("B", "1", Some("A"), &["C"]),
            community("C", "2", Some("B"), &[]),
        ];
        let oracle = RatingOracle::new(&[("A", 5), ("B", 5), ("C", 5)]);
        let params = DynamicCommunitySelectionParams {
            max_level: 1,
            ..params()
        };
        let selector = selection(oracle.clone(), communities, params);

        let result = selector.select("query", &CancellationToken::new()).await.unwrap();
        assert_eq!(selected_ids(&result), vec!["B"]);
        assert!(!result.ratings.contains_key("C"));
    }

    #[tokio::test]
    async fn children_are_found_through_parent_links() {
        let communities = vec![
            community("A", "0", None, &[]),
            community("B", "1", Some("A"), &[]),
        ];
        let oracle = RatingOracle::new(&[("A", 3), ("B", 3)]);
        let selector = selection(oracle, communities, params());

        let result = selector.select("query", &CancellationToken::new()).await.unwrap();
        assert_eq!(selected_ids(&result), vec!["B"]);
    }

    #[test]
    fn zero_concurrency_is_a_config_error() {
        let params = DynamicCommunitySelectionParams {
            concurrent_coroutines: 0,
            ..params()
        };
        let result = DynamicCommunitySelection::new(Vec::new(), Vec::new(), RatingOracle::new(&[]), word_count, params);
        assert!(matches!(result, Err(GraphRagError::Config(_))));
    }
}
