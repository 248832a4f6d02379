use std::collections::BTreeMap;
use std::fmt;

/// Legal validity of a document, as published by the bureau.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effectiveness {
    FullyRepealed,
    FullyInvalid,
    FullyValid,
    Amended,
    /// A code the lookup table does not know, kept verbatim.
    Unknown(i64),
    /// Free-text label taken straight from a detail page.
    Stated(String),
}

impl Effectiveness {
    pub fn label(&self) -> String {
        match self {
            Effectiveness::FullyRepealed => "全文废止".to_string(),
            Effectiveness::FullyInvalid => "全文失效".to_string(),
            Effectiveness::FullyValid => "全文有效".to_string(),
            Effectiveness::Amended => "已修改".to_string(),
            Effectiveness::Unknown(code) => format!("未知状态({})", code),
            Effectiveness::Stated(text) => text.clone(),
        }
    }
}

impl fmt::Display for Effectiveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Immutable code → label table handed to the adapters that need it.
#[derive(Debug, Clone)]
pub struct StatusTable {
    codes: BTreeMap<i64, Effectiveness>,
}

impl StatusTable {
    pub fn new(codes: impl IntoIterator<Item = (i64, Effectiveness)>) -> Self {
        StatusTable {
            codes: codes.into_iter().collect(),
        }
    }

    /// The `yxx` codes of the national tax knowledge base.
    pub fn chinatax() -> Self {
        StatusTable::new([
            (961, Effectiveness::FullyRepealed),
            (962, Effectiveness::FullyRepealed),
            (963, Effectiveness::FullyValid),
            (964, Effectiveness::Amended),
            (965, Effectiveness::FullyInvalid),
            (966, Effectiveness::FullyRepealed),
        ])
    }

    /// Most Q&A and guide documents carry no code at all; those count as valid.
    pub fn resolve(&self, code: Option<i64>) -> Effectiveness {
        match code {
            None => Effectiveness::FullyValid,
            Some(code) => self
                .codes
                .get(&code)
                .cloned()
                .unwrap_or(Effectiveness::Unknown(code)),
        }
    }
}
