//! Read-query signatures and the cache keys derived from them.

use crate::application::repos::{GalleryQuery, ListScope, DEFAULT_PAGE_LIMIT};

/// Which derived list a cached page belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadView {
    Gallery,
    History,
}

impl ReadView {
    fn prefix(self) -> &'static str {
        match self {
            ReadView::Gallery => "gallery",
            ReadView::History => "history",
        }
    }
}

/// Everything that distinguishes one cached page from another.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadQuery {
    pub view: ReadView,
    pub scope: ListScope,
    pub query: GalleryQuery,
}

impl ReadQuery {
    pub fn gallery(scope: ListScope, query: GalleryQuery) -> Self {
        Self {
            view: ReadView::Gallery,
            scope,
            query,
        }
    }

    /// History pages are only windowed; filters and sort do not apply.
    pub fn history(scope: ListScope, limit: u32, offset: u32) -> Self {
        Self {
            view: ReadView::History,
            scope,
            query: GalleryQuery {
                limit,
                offset,
                ..GalleryQuery::default()
            },
        }
    }

    /// The unfiltered first page of `view`, the one mutations invalidate eagerly.
    pub fn default_first_page(view: ReadView, scope: ListScope) -> Self {
        match view {
            ReadView::Gallery => Self::gallery(scope, GalleryQuery::default()),
            ReadView::History => Self::history(scope, DEFAULT_PAGE_LIMIT, 0),
        }
    }

    pub fn cache_key(&self) -> String {
        let scope = match &self.scope {
            ListScope::Requester(id) => format!("user:{id}"),
            ListScope::All => "admin".to_string(),
        };
        let filter = serde_json::to_string(&self.query.filter).unwrap_or_default();
        format!(
            "{}:{scope}:{filter}:{}:{}:{}:{}",
            self.view.prefix(),
            self.query.sort_by.as_str(),
            self.query.sort_order.as_str(),
            self.query.limit,
            self.query.offset
        )
    }
}

/// Keys whose cached pages a mutation touching `requester_id` can change.
pub fn keys_affected_by(requester_id: &str) -> Vec<String> {
    [ReadView::Gallery, ReadView::History]
        .into_iter()
        .flat_map(|view| {
            [
                ReadQuery::default_first_page(view, ListScope::Requester(requester_id.to_string())),
                ReadQuery::default_first_page(view, ListScope::All),
            ]
        })
        .map(|query| query.cache_key())
        .collect()
}
