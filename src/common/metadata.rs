/// Unified metadata representation for OOXML core document properties
/// (`docProps/core.xml`): title, author, last-modified-by, timestamps.
use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

/// Unified document metadata structure.
///
/// Contains standard document properties that can be extracted from
/// both OLE and OOXML document formats.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    /// Document title
    pub title: Option<String>,
    /// Document subject
    pub subject: Option<String>,
    /// Document author/creator
    pub author: Option<String>,
    /// Keywords associated with the document
    pub keywords: Option<String>,
    /// Document description/comments
    pub description: Option<String>,
    /// Template used to create the document
    pub template: Option<String>,
    /// Last person to modify the document
    pub last_modified_by: Option<String>,
    /// Revision number
    pub revision: Option<String>,
    /// Creation date (Unix timestamp)
    pub created: Option<DateTime<Utc>>,
    /// Last modification date (Unix timestamp)
    pub modified: Option<DateTime<Utc>>,
    /// Number of pages
    pub page_count: Option<u32>,
    /// Number of words
    pub word_count: Option<u32>,
    /// Number of characters
    pub character_count: Option<u32>,
    /// Application that created the document
    pub application: Option<String>,
    /// Document category
    pub category: Option<String>,
    /// Company/organization
    pub company: Option<String>,
    /// Manager name
    pub manager: Option<String>,
    /// Content status (draft, final, etc.)
    pub content_status: Option<String>,
    /// Last printed time
    pub last_printed_time: Option<DateTime<Utc>>,
    /// Security level
    pub security: Option<u32>,
    /// Codepage for text encoding
    pub codepage: Option<u32>,
}

impl Metadata {
    /// Check if the metadata contains any actual data.
    ///
    /// Returns true if at least one field is populated.
    pub fn has_data(&self) -> bool {
        self.title.is_some()
            || self.subject.is_some()
            || self.author.is_some()
            || self.keywords.is_some()
            || self.description.is_some()
            || self.template.is_some()
            || self.last_modified_by.is_some()
            || self.revision.is_some()
            || self.created.is_some()
            || self.modified.is_some()
            || self.page_count.is_some()
            || self.word_count.is_some()
            || self.character_count.is_some()
            || self.application.is_some()
            || self.category.is_some()
            || self.company.is_some()
            || self.manager.is_some()
            || self.security.is_some()
            || self.codepage.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_has_data() {
        let empty_metadata = Metadata::default();
        assert!(!empty_metadata.has_data());

        let metadata_with_title = Metadata {
            title: Some("Test Document".to_string()),
            ..Default::default()
        };
        assert!(metadata_with_title.has_data());
    }

}
