pub mod articles;
pub mod blocks;
pub mod tree;

use thiserror::Error;

use crate::db::StoredDocument;
use articles::ParsedArticle;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("document {0} has no content blocks")]
    EmptyContent(String),
    #[error("document {0} has no document number")]
    MissingDocumentNumber(String),
}

/// Three-step pipeline: blocks → structure tree → articles.
pub fn parse(doc: &StoredDocument) -> Result<Vec<ParsedArticle>, ParseError> {
    let document_number = doc.document_number.trim();
    if document_number.is_empty() {
        return Err(ParseError::MissingDocumentNumber(doc.doc_id.clone()));
    }

    let nodes = blocks::classify_blocks(&doc.blocks);
    if nodes.is_empty() {
        return Err(ParseError::EmptyContent(doc.doc_id.clone()));
    }

    let roots = tree::build_tree(nodes);
    Ok(articles::extract_articles(document_number, &roots))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::DocType;

    fn doc(number: &str, blocks: &[&str]) -> StoredDocument {
        StoredDocument {
            doc_id: "98765".into(),
            doc_type: DocType::Law,
            document_number: number.into(),
            title: None,
            blocks: blocks.iter().map(|b| b.to_string()).collect(),
        }
    }

    #[test]
    fn fixture_decree() {
        let text = std::fs::read_to_string("tests/fixtures/nghi_dinh.txt").unwrap();
        let blocks: Vec<&str> = text.lines().collect();
        let arts = parse(&doc("15/2024/NĐ-CP", &blocks)).unwrap();

        let numbers: Vec<&str> = arts.iter().map(|a| a.number.as_str()).collect();
        assert_eq!(numbers, vec!["1", "2", "3", "4", "5"]);
        assert!(arts.iter().all(|a| a.article_id.starts_with("15/2024/NĐ-CP-ART-")));
        assert_eq!(arts[0].hierarchy_path, vec!["Chương I"]);
        assert_eq!(arts[3].hierarchy_path, vec!["Chương II", "Mục 1"]);
        assert_eq!(arts[4].hierarchy_path, vec!["Chương III"]);
        assert!(arts[2].content.iter().any(|c| c.starts_with("a)")));
        // The signature block after the last article is plain content under it.
        assert!(arts[4].content.len() >= 1);
    }

    #[test]
    fn empty_document_is_an_error() {
        let err = parse(&doc("01/2024/QH15", &["", "  "])).unwrap_err();
        assert!(matches!(err, ParseError::EmptyContent(_)));
    }

    #[test]
    fn missing_number_is_an_error() {
        let err = parse(&doc(" ", &["Điều 1. A"])).unwrap_err();
        assert!(matches!(err, ParseError::MissingDocumentNumber(_)));
    }

    #[test]
    fn reparse_is_deterministic() {
        let d = doc("X", &["Chương I", "Điều 1. A", "1. B", "Điều 2. C"]);
        assert_eq!(parse(&d).unwrap(), parse(&d).unwrap());
    }
}
