use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use shinkai_graphrag::{
    context_builder::{
        community_context::{CommunityContextBuilderParams, GlobalCommunityContext},
        conversation_history::ConversationHistory,
        dynamic_community_selection::{DynamicCommunitySelection, DynamicCommunitySelectionParams},
    },
    llm::base::GlobalSearchPhase,
    models::{Community, CommunityReport},
    search::{
        base::SearchOptions,
        global_search::{
            prompts::{GENERAL_KNOWLEDGE_INSTRUCTION, NO_DATA_ANSWER},
            search::{GlobalSearch, GlobalSearchParams},
        },
    },
    GraphRagError,
};
use tokio_util::sync::CancellationToken;
use utils::{init_tracing, mock::MockLLM, word_count};

mod utils;

fn report(community_id: &str, title: &str, content: &str) -> CommunityReport {
    CommunityReport {
        id: format!("report-{}", community_id),
        short_id: Some(community_id.to_string()),
        title: title.to_string(),
        community_id: community_id.to_string(),
        level: Some("0".to_string()),
        full_content: content.to_string(),
        summary: content.to_string(),
        rank: Some(5.0),
        ..Default::default()
    }
}

fn reports() -> Vec<CommunityReport> {
    vec![
        report("1", "Alpha", "alpha report text"),
        report("2", "Beta", "beta report text"),
    ]
}

// header 2 words + row 3 words: one report per batch
fn one_report_per_batch() -> CommunityContextBuilderParams {
    CommunityContextBuilderParams {
        shuffle_data: false,
        include_community_weight: false,
        max_tokens: 6,
        ..Default::default()
    }
}

fn map_reply(points: &[(&str, i64)]) -> String {
    let points: Vec<serde_json::Value> = points
        .iter()
        .map(|(description, score)| serde_json::json!({"description": description, "score": score}))
        .collect();
    serde_json::json!({ "points": points }).to_string()
}

fn scripted_llm() -> Arc<MockLLM> {
    Arc::new(MockLLM::new(|messages, search_phase| {
        let system_prompt = &messages[0].content;
        match search_phase {
            Some(GlobalSearchPhase::Map) if system_prompt.contains("alpha") => map_reply(&[("alpha point", 20)]),
            Some(GlobalSearchPhase::Map) if system_prompt.contains("beta") => map_reply(&[("beta point", 80)]),
            Some(GlobalSearchPhase::Map) => map_reply(&[]),
            _ => "final answer".to_string(),
        }
    }))
}

fn search_params(llm: Arc<MockLLM>, reports: Vec<CommunityReport>) -> GlobalSearchParams {
    let context_builder = GlobalCommunityContext::new(reports, None, word_count);
    let mut params = GlobalSearchParams::new(llm, Box::new(context_builder), word_count);
    params.map_system_prompt = Some("{context_data}".to_string());
    params.reduce_system_prompt = Some("{report_data}".to_string());
    params.context_builder_params = one_report_per_batch();
    params
}

#[tokio::test]
async fn reduce_prompt_orders_analysts_by_score() {
    init_tracing();
    let llm = scripted_llm();
    let search_engine = GlobalSearch::new(search_params(llm.clone(), reports())).unwrap();

    let result = search_engine
        .search("what happened?", None, SearchOptions::verbose())
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert_eq!(result.response(), "final answer");

    let reduce_calls = llm.calls_in_phase(GlobalSearchPhase::Reduce);
    assert_eq!(reduce_calls.len(), 1);
    assert_eq!(
        reduce_calls[0].system_prompt(),
        "----Analyst 2----\nImportance Score: 80\nbeta point\n\n----Analyst 1----\nImportance Score: 20\nalpha point"
    );
    assert_eq!(reduce_calls[0].messages[1].content, "what happened?");

    let map_calls = llm.calls_in_phase(GlobalSearchPhase::Map);
    assert_eq!(map_calls.len(), 2);
    assert!(map_calls.iter().all(|call| call.llm_params.json));

    let details = result.details.unwrap();
    assert_eq!(details.context_text.len(), 2);
    assert_eq!(details.map_responses.len(), 2);
    assert_eq!(details.llm_calls, 3);
}

#[tokio::test]
async fn zero_score_points_return_the_no_data_answer() {
    let llm = Arc::new(MockLLM::new(|_, _| map_reply(&[("nothing useful", 0)])));
    let search_engine = GlobalSearch::new(search_params(llm.clone(), reports())).unwrap();

    let result = search_engine
        .search("what happened?", None, SearchOptions::verbose())
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert_eq!(result.response(), NO_DATA_ANSWER);
    assert!(llm.calls_in_phase(GlobalSearchPhase::Reduce).is_empty());

    let details = result.details.unwrap();
    assert_eq!(details.llm_calls, 2);
    assert_eq!(details.reduce_context_text, None);
}

#[tokio::test]
async fn malformed_map_reply_is_absorbed() {
    let llm = Arc::new(MockLLM::new(|messages, search_phase| match search_phase {
        Some(GlobalSearchPhase::Map) if messages[0].content.contains("alpha") => "not json at all".to_string(),
        Some(GlobalSearchPhase::Map) => map_reply(&[("beta point", 60)]),
        _ => "final answer".to_string(),
    }));
    let search_engine = GlobalSearch::new(search_params(llm.clone(), reports())).unwrap();

    let result = search_engine
        .search("what happened?", None, SearchOptions::default())
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert_eq!(result.response(), "final answer");
    let reduce_calls = llm.calls_in_phase(GlobalSearchPhase::Reduce);
    assert_eq!(
        reduce_calls[0].system_prompt(),
        "----Analyst 2----\nImportance Score: 60\nbeta point"
    );
}

#[tokio::test]
async fn general_knowledge_skips_the_no_data_exit() {
    let llm = Arc::new(MockLLM::new(|_, search_phase| match search_phase {
        Some(GlobalSearchPhase::Map) => map_reply(&[]),
        _ => "general answer".to_string(),
    }));
    let mut params = search_params(llm.clone(), reports());
    params.allow_general_knowledge = true;
    let search_engine = GlobalSearch::new(params).unwrap();

    let result = search_engine
        .search("what happened?", None, SearchOptions::default())
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert_eq!(result.response(), "general answer");
    let reduce_calls = llm.calls_in_phase(GlobalSearchPhase::Reduce);
    assert_eq!(reduce_calls.len(), 1);
    assert!(reduce_calls[0].system_prompt().ends_with(GENERAL_KNOWLEDGE_INSTRUCTION));
}

#[tokio::test]
async fn streaming_records_history_after_the_stop_chunk() {
    let llm = Arc::new(MockLLM::new(|_, search_phase| match search_phase {
        Some(GlobalSearchPhase::Map) => map_reply(&[("beta point", 80)]),
        _ => "the streamed answer".to_string(),
    }));
    let search_engine = GlobalSearch::new(search_params(llm, reports())).unwrap();
    let history = ConversationHistory::new().shared();

    let options = SearchOptions {
        streaming: true,
        verbose: true,
        ..Default::default()
    };
    let mut stream = search_engine
        .search("what happened?", Some(history.clone()), options)
        .await
        .unwrap()
        .into_stream()
        .unwrap();

    assert!(history.read().await.is_empty());

    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk.unwrap());
    }

    let answer: String = chunks.iter().map(|chunk| chunk.delta.as_str()).collect();
    assert_eq!(answer, "the streamed answer");
    assert_eq!(chunks.len(), 3);

    let (last, rest) = chunks.split_last().unwrap();
    assert_eq!(last.finish_reason.as_deref(), Some("stop"));
    assert!(last.details.is_some());
    assert!(rest.iter().all(|chunk| chunk.details.is_none() && chunk.finish_reason.is_none()));

    let history = history.read().await;
    assert_eq!(history.len(), 2);
    assert_eq!(history.turns[0].content, "what happened?");
    assert_eq!(history.turns[1].content, "the streamed answer");
}

#[tokio::test]
async fn blocking_search_appends_the_exchange_to_history() {
    let search_engine = GlobalSearch::new(search_params(scripted_llm(), reports())).unwrap();
    let history = ConversationHistory::new().shared();

    search_engine
        .search("what happened?", Some(history.clone()), SearchOptions::default())
        .await
        .unwrap();

    let history = history.read().await;
    assert_eq!(history.len(), 2);
    assert_eq!(history.turns[1].content, "final answer");
}

#[tokio::test]
async fn cancellation_aborts_the_map_phase() {
    let llm = Arc::new(MockLLM::new(|_, _| map_reply(&[("late", 50)])).with_delay(Duration::from_secs(30)));
    let search_engine = GlobalSearch::new(search_params(llm.clone(), reports())).unwrap();

    let cancellation_token = CancellationToken::new();
    let canceller = cancellation_token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let options = SearchOptions {
        cancellation_token,
        ..Default::default()
    };
    let result = search_engine.search("what happened?", None, options).await;

    assert!(matches!(result, Err(GraphRagError::Cancelled)));
    assert!(llm.calls().is_empty());
}

#[tokio::test]
async fn invalid_configuration_fails_before_any_call() {
    let llm = scripted_llm();

    let mut params = search_params(llm.clone(), reports());
    params.concurrent_coroutines = 0;
    assert!(GlobalSearch::new(params).err().unwrap().is_config());

    let mut params = search_params(llm.clone(), reports());
    params.context_builder_params.max_tokens = 0;
    assert!(GlobalSearch::new(params).err().unwrap().is_config());

    assert!(llm.calls().is_empty());
}

#[tokio::test]
async fn dynamic_selection_feeds_only_relevant_reports() {
    let llm = Arc::new(MockLLM::new(|messages, search_phase| {
        let system_prompt = &messages[0].content;
        match search_phase {
            Some(GlobalSearchPhase::CommunitySelection) if system_prompt.contains("beta") => {
                r#"{"rating": 4}"#.to_string()
            }
            Some(GlobalSearchPhase::CommunitySelection) => r#"{"rating": 1}"#.to_string(),
            Some(GlobalSearchPhase::Map) => map_reply(&[("beta point", 80)]),
            _ => "final answer".to_string(),
        }
    }));

    let communities = vec![
        Community {
            id: "1".to_string(),
            level: "0".to_string(),
            ..Default::default()
        },
        Community {
            id: "2".to_string(),
            level: "0".to_string(),
            ..Default::default()
        },
    ];
    let selection = DynamicCommunitySelection::new(
        reports(),
        communities,
        llm.clone(),
        word_count,
        DynamicCommunitySelectionParams {
            rate_query: "{description}".to_string(),
            ..Default::default()
        },
    )
    .unwrap();

    let context_builder =
        GlobalCommunityContext::new(reports(), None, word_count).with_dynamic_community_selection(selection);
    let mut params = GlobalSearchParams::new(llm.clone(), Box::new(context_builder), word_count);
    params.map_system_prompt = Some("{context_data}".to_string());
    params.context_builder_params = one_report_per_batch();
    let search_engine = GlobalSearch::new(params).unwrap();

    let result = search_engine
        .search("what about beta?", None, SearchOptions::verbose())
        .await
        .unwrap()
        .into_result()
        .unwrap();

    let map_calls = llm.calls_in_phase(GlobalSearchPhase::Map);
    assert_eq!(map_calls.len(), 1);
    assert!(map_calls[0].system_prompt().contains("beta report text"));

    // two ratings, one map call, one reduce call
    assert_eq!(result.details.unwrap().llm_calls, 4);
}

#[tokio::test]
async fn map_calls_respect_the_concurrency_limit() {
    let llm = Arc::new(
        MockLLM::new(|_, search_phase| match search_phase {
            Some(GlobalSearchPhase::Map) => map_reply(&[("a point", 50)]),
            _ => "final answer".to_string(),
        })
        .with_delay(Duration::from_millis(20)),
    );
    let reports: Vec<CommunityReport> = (1..=6)
        .map(|index| report(&index.to_string(), &format!("R{}", index), "some report text"))
        .collect();

    let mut params = search_params(llm.clone(), reports);
    params.concurrent_coroutines = 2;
    let search_engine = GlobalSearch::new(params).unwrap();

    let result = search_engine
        .search("what happened?", None, SearchOptions::verbose())
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert_eq!(result.details.unwrap().context_text.len(), 6);
    assert_eq!(llm.calls_in_phase(GlobalSearchPhase::Map).len(), 6);
    assert_eq!(llm.peak_in_flight(), 2);
}

#[tokio::test]
async fn community_ratings_respect_the_concurrency_limit() {
    let llm = Arc::new(MockLLM::new(|_, _| r#"{"rating": 4}"#.to_string()).with_delay(Duration::from_millis(20)));
    let ids: Vec<String> = (1..=6).map(|index| index.to_string()).collect();
    let communities: Vec<Community> = ids
        .iter()
        .map(|id| Community {
            id: id.clone(),
            level: "0".to_string(),
            ..Default::default()
        })
        .collect();
    let reports: Vec<CommunityReport> = ids.iter().map(|id| report(id, id, "report text")).collect();

    let selection = DynamicCommunitySelection::new(
        reports,
        communities,
        llm.clone(),
        word_count,
        DynamicCommunitySelectionParams {
            rate_query: "{description}".to_string(),
            concurrent_coroutines: 2,
            ..Default::default()
        },
    )
    .unwrap();

    let result = selection.select("what happened?", &CancellationToken::new()).await.unwrap();

    assert_eq!(result.ratings.len(), 6);
    assert_eq!(result.reports.len(), 6);
    assert_eq!(llm.peak_in_flight(), 2);
}

fn streaming_verbose() -> SearchOptions {
    SearchOptions {
        streaming: true,
        verbose: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn length_finish_still_ends_the_stream() {
    let llm = Arc::new(
        MockLLM::new(|_, search_phase| match search_phase {
            Some(GlobalSearchPhase::Map) => map_reply(&[("beta point", 80)]),
            _ => "a truncated answer".to_string(),
        })
        .with_final_finish_reason(Some("length")),
    );
    let search_engine = GlobalSearch::new(search_params(llm, reports())).unwrap();
    let history = ConversationHistory::new().shared();

    let mut stream = search_engine
        .search("what happened?", Some(history.clone()), streaming_verbose())
        .await
        .unwrap()
        .into_stream()
        .unwrap();

    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk.unwrap());
    }

    let last = chunks.last().unwrap();
    assert_eq!(last.finish_reason.as_deref(), Some("length"));
    assert!(last.details.is_some());

    let history = history.read().await;
    assert_eq!(history.len(), 2);
    assert_eq!(history.turns[1].content, "a truncated answer");
}

#[tokio::test]
async fn stream_without_finish_reason_closes_with_details() {
    let llm = Arc::new(
        MockLLM::new(|_, search_phase| match search_phase {
            Some(GlobalSearchPhase::Map) => map_reply(&[("beta point", 80)]),
            _ => "an open answer".to_string(),
        })
        .with_final_finish_reason(None),
    );
    let search_engine = GlobalSearch::new(search_params(llm, reports())).unwrap();
    let history = ConversationHistory::new().shared();

    let mut stream = search_engine
        .search("what happened?", Some(history.clone()), streaming_verbose())
        .await
        .unwrap()
        .into_stream()
        .unwrap();

    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk.unwrap());
    }

    assert_eq!(chunks.len(), 4);
    let (last, rest) = chunks.split_last().unwrap();
    assert!(last.delta.is_empty());
    assert!(last.details.is_some());
    assert!(rest.iter().all(|chunk| chunk.details.is_none()));

    let history = history.read().await;
    assert_eq!(history.len(), 2);
    assert_eq!(history.turns[1].content, "an open answer");
}
