use std::sync::LazyLock;

use regex::Regex;

static PART_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^phần\s+\w").unwrap());
static PART_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^phần\s+(thứ\s+\w+|[IVXLCDM]+\b|\d+\b)").unwrap());
static CHAPTER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^chương\s+([IVXLCDM]+|\d+)\b").unwrap());
static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^mục\s+(\d+)").unwrap());
static ARTICLE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^điều\s+(\d+)").unwrap());
static CLAUSE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d+)\.").unwrap());
static POINT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^([a-zđ])\)").unwrap());

/// Structural role of one text block. Declaration order is nesting depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureKind {
    Part,
    Chapter,
    Section,
    Article,
    Clause,
    Point,
    Content,
}

impl StructureKind {
    /// Kinds that open a level, in classification priority.
    pub const HIERARCHY: [StructureKind; 6] = [
        StructureKind::Part,
        StructureKind::Chapter,
        StructureKind::Section,
        StructureKind::Article,
        StructureKind::Clause,
        StructureKind::Point,
    ];

    /// Depth in the hierarchy; `None` for plain content.
    pub fn level(&self) -> Option<usize> {
        match self {
            StructureKind::Part => Some(0),
            StructureKind::Chapter => Some(1),
            StructureKind::Section => Some(2),
            StructureKind::Article => Some(3),
            StructureKind::Clause => Some(4),
            StructureKind::Point => Some(5),
            StructureKind::Content => None,
        }
    }

    fn pattern(&self) -> Option<&'static Regex> {
        match self {
            StructureKind::Part => Some(&*PART_RE),
            StructureKind::Chapter => Some(&*CHAPTER_RE),
            StructureKind::Section => Some(&*SECTION_RE),
            StructureKind::Article => Some(&*ARTICLE_RE),
            StructureKind::Clause => Some(&*CLAUSE_RE),
            StructureKind::Point => Some(&*POINT_RE),
            StructureKind::Content => None,
        }
    }

    fn number_pattern(&self) -> Option<&'static Regex> {
        match self {
            StructureKind::Part => Some(&*PART_NUMBER_RE),
            other => other.pattern(),
        }
    }

    fn label_prefix(&self) -> &'static str {
        match self {
            StructureKind::Part => "Phần",
            StructureKind::Chapter => "Chương",
            StructureKind::Section => "Mục",
            StructureKind::Article => "Điều",
            StructureKind::Clause => "Khoản",
            StructureKind::Point => "Điểm",
            StructureKind::Content => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructureNode {
    pub kind: StructureKind,
    pub number: String,
    pub text: String,
    pub children: Vec<StructureNode>,
}

impl StructureNode {
    /// Short label used in hierarchy paths, e.g. "Chương II".
    pub fn label(&self) -> String {
        if self.number.is_empty() || self.kind == StructureKind::Content {
            self.text.clone()
        } else {
            format!("{} {}", self.kind.label_prefix(), self.number)
        }
    }
}

/// First matching kind in priority order wins; anything else is content.
pub fn classify_kind(text: &str) -> StructureKind {
    StructureKind::HIERARCHY
        .into_iter()
        .find(|kind| kind.pattern().is_some_and(|re| re.is_match(text)))
        .unwrap_or(StructureKind::Content)
}

pub fn extract_number(kind: StructureKind, text: &str) -> String {
    kind.number_pattern()
        .and_then(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().split_whitespace().collect::<Vec<_>>().join(" "))
        .unwrap_or_default()
}

/// Turn raw blocks into leaf nodes, dropping blank ones.
pub fn classify_blocks<S: AsRef<str>>(blocks: &[S]) -> Vec<StructureNode> {
    blocks
        .iter()
        .map(|b| b.as_ref().trim())
        .filter(|t| !t.is_empty())
        .map(|text| {
            let kind = classify_kind(text);
            StructureNode {
                kind,
                number: extract_number(kind, text),
                text: text.to_string(),
                children: Vec::new(),
            }
        })
        .collect()
}
