use std::sync::LazyLock;

use regex::Regex;

use super::blocks::{StructureKind, StructureNode};

static SPACES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static REF_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\b(điều\s+\d+)\b").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedArticle {
    pub article_id: String,
    pub number: String,
    /// The "Điều N. ..." heading line itself.
    pub title: String,
    /// Clause, point and content text under the article, in document order.
    pub content: Vec<String>,
    /// Part/Chapter/Section labels above the article, outermost first.
    pub hierarchy_path: Vec<String>,
}

pub fn article_id(document_number: &str, article_number: &str) -> String {
    format!("{}-ART-{}", document_number, article_number)
}

/// Collect one record per ARTICLE node with a pre-order walk over the tree.
pub fn extract_articles(document_number: &str, roots: &[StructureNode]) -> Vec<ParsedArticle> {
    let mut path = Vec::new();
    roots.iter().fold(Vec::new(), |acc, node| {
        collect(document_number, node, &mut path, None, acc)
    })
}

fn collect(
    document_number: &str,
    node: &StructureNode,
    path: &mut Vec<String>,
    owner: Option<usize>,
    mut acc: Vec<ParsedArticle>,
) -> Vec<ParsedArticle> {
    let mut owner = owner;
    let mut opened_level = false;

    match node.kind {
        StructureKind::Part | StructureKind::Chapter | StructureKind::Section => {
            path.push(node.label());
            opened_level = true;
        }
        StructureKind::Article => {
            acc.push(ParsedArticle {
                article_id: article_id(document_number, &node.number),
                number: node.number.clone(),
                title: node.text.clone(),
                content: Vec::new(),
                hierarchy_path: path.clone(),
            });
            owner = Some(acc.len() - 1);
        }
        StructureKind::Clause | StructureKind::Point | StructureKind::Content => {
            if let Some(idx) = owner {
                acc[idx].content.push(node.text.clone());
            }
        }
    }

    for child in &node.children {
        acc = collect(document_number, child, path, owner, acc);
    }

    if opened_level {
        path.pop();
    }
    acc
}

/// Normalised article text: whitespace collapsed per line, cross references
/// to other articles marked as `[REF:Điều N]`.
pub fn clean_content(content: &[String]) -> String {
    content
        .iter()
        .map(|line| {
            let collapsed = SPACES_RE.replace_all(line, " ");
            REF_RE
                .replace_all(collapsed.trim(), "[REF:${1}]")
                .into_owned()
        })
        .collect::<Vec<_>>()
        .join("\n")
}
