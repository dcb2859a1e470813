//! Wire-level types shared at API boundaries: the response envelope and
//! pagination request/response shapes (spec §6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl Meta {
    pub fn now() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            duration_ms: None,
        }
    }
}

/// The API response envelope: `{success, data?, error?, meta?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self { success: true, data: Some(data), error: None, meta: Some(Meta::now()) }
    }

    pub fn err(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiErrorBody { code: code.into(), message: message.into(), details: None }),
            meta: Some(Meta::now()),
        }
    }
}

/// Pagination request: `{page, pageSize, cursor?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cursor: Option<String>,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: default_page(), page_size: default_page_size(), cursor: None }
    }
}

fn default_page() -> u32 {
    1
}
fn default_page_size() -> u32 {
    20
}

pub const MAX_PAGE_SIZE: u32 = 100;

impl PageRequest {
    /// Clamp `page_size` to the documented [1, MAX_PAGE_SIZE] range and
    /// `page` to at least 1 (pages are 1-indexed).
    pub fn normalized(&self) -> Self {
        Self {
            page: self.page.max(1),
            page_size: self.page_size.clamp(1, MAX_PAGE_SIZE),
            cursor: self.cursor.clone(),
        }
    }
}

/// Pagination response: `{items, total, page, pageSize, hasMore, nextCursor?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagedResponse<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

impl<T> PagedResponse<T> {
    /// Build a page from a full slice of already-filtered, already-ordered
    /// items and a normalized request.
    pub fn paginate(all: Vec<T>, req: &PageRequest) -> Self {
        let req = req.normalized();
        let total = all.len() as u64;
        let start = ((req.page - 1) as usize) * (req.page_size as usize);
        let items: Vec<T> = all.into_iter().skip(start).take(req.page_size as usize).collect();
        let has_more = (start as u64) + (items.len() as u64) < total;
        Self {
            items,
            total,
            page: req.page,
            page_size: req.page_size,
            has_more,
            next_cursor: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_ok_carries_data_no_error() {
        let env = Envelope::ok(42);
        assert!(env.success);
        assert_eq!(env.data, Some(42));
        assert!(env.error.is_none());
    }

    #[test]
    fn envelope_err_carries_no_data() {
        let env: Envelope<()> = Envelope::err("NOT_FOUND", "session missing");
        assert!(!env.success);
        assert_eq!(env.error.unwrap().code, "NOT_FOUND");
    }

    #[test]
    fn page_size_clamped_to_max() {
        let req = PageRequest { page: 1, page_size: 9999, cursor: None };
        assert_eq!(req.normalized().page_size, MAX_PAGE_SIZE);
    }

    #[test]
    fn pagination_computes_has_more() {
        let all: Vec<u32> = (0..45).collect();
        let req = PageRequest { page: 1, page_size: 20, cursor: None };
        let page1 = PagedResponse::paginate(all.clone(), &req);
        assert_eq!(page1.items.len(), 20);
        assert!(page1.has_more);

        let req3 = PageRequest { page: 3, page_size: 20, cursor: None };
        let page3 = PagedResponse::paginate(all, &req3);
        assert_eq!(page3.items.len(), 5);
        assert!(!page3.has_more);
    }
}
