use crmgate_core::domain::records::{FromCrmRecord, KnowledgeArticle};
use crmgate_core::{
    CallScope, Filter, OrderBy, QuerySpec, SearchStrategy, SessionContext, TextSearch, ToolError, ToolErrorCode,
    ToolResponse,
};
use serde::Serialize;
use serde_json::Value;

use super::{payload, CrmToolService};
use crate::params::{GetArticleParams, SearchArticlesParams};
use crate::validation::{clamp_limit, record_id, required_text};

const DEFAULT_ARTICLE_LIMIT: u32 = 10;
const MAX_ARTICLE_LIMIT: u32 = 25;

#[derive(Debug, Serialize)]
struct ArticleList {
    articles: Vec<KnowledgeArticle>,
    total_count: usize,
    has_more: bool,
    search_method: Option<SearchStrategy>,
}

#[derive(Debug, Serialize)]
struct ArticleDetail {
    article: KnowledgeArticle,
}

impl CrmToolService {
    pub async fn search_articles(&self, session: &SessionContext, params: SearchArticlesParams) -> ToolResponse {
        let run = self.begin("search_articles", session);
        let outcome = self.find_articles(&run.scope, params).await;
        run.finish(outcome)
    }

    async fn find_articles(&self, scope: &CallScope<'_>, params: SearchArticlesParams) -> Result<Value, ToolError> {
        self.require_knowledge()?;
        let query = required_text("query", &params.query)?;
        let limit = clamp_limit(params.limit, DEFAULT_ARTICLE_LIMIT, MAX_ARTICLE_LIMIT);

        let search = TextSearch::new::<KnowledgeArticle>(query, "Title")
            .filter(self.published_articles())
            .order_by(OrderBy::desc("LastPublishedDate"))
            .limit(limit);
        let result = self.executor.search_text::<KnowledgeArticle>(scope, search).await?;

        payload(&ArticleList {
            total_count: result.total_count,
            has_more: result.has_more,
            search_method: result.strategy,
            articles: result.records,
        })
    }

    pub async fn get_article(&self, session: &SessionContext, params: GetArticleParams) -> ToolResponse {
        let run = self.begin("get_article", session);
        let outcome = self.article(&run.scope, params).await;
        run.finish(outcome)
    }

    async fn article(&self, scope: &CallScope<'_>, params: GetArticleParams) -> Result<Value, ToolError> {
        self.require_knowledge()?;
        let article_id = record_id("article_id", &params.article_id)?;

        let mut fields = KnowledgeArticle::FIELDS.to_vec();
        fields.push("ArticleBody");
        let predicates = std::iter::once(Filter::eq("Id", article_id)).chain(self.published_articles()).collect();
        let spec = QuerySpec::new(KnowledgeArticle::OBJECT, &fields).filter(Filter::all(predicates)).limit(1);
        let result = self.executor.fetch::<KnowledgeArticle>(scope, spec).await?;

        match result.records.into_iter().next() {
            Some(article) => payload(&ArticleDetail { article }),
            None => Err(ToolError::not_found(format!("Knowledge article '{article_id}' not found or not published."))),
        }
    }

    fn require_knowledge(&self) -> Result<(), ToolError> {
        if self.knowledge.enabled {
            Ok(())
        } else {
            Err(ToolError::new(
                ToolErrorCode::FeatureDisabled,
                "Knowledge articles are not enabled for this organization.",
            ))
        }
    }

    /// Online, latest-version articles in the configured language.
    fn published_articles(&self) -> Option<Filter> {
        Filter::all(vec![
            Filter::eq("PublishStatus", "Online"),
            Filter::eq("Language", self.knowledge.language.as_str()),
            Filter::eq("IsLatestVersion", true),
        ])
    }
}
