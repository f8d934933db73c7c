//! Region Tree
//!
//! The structured form of a function body. Every block of the function appears as
//! exactly one [`Region::Leaf`]; conditions and loop tests refer back to the leaf of the
//! block whose branch they use.

use crate::decompiler::ir::{BlockId, InstId};
use serde::{Deserialize, Serialize};

/// The branch a structured construct tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Condition {
    /// Block ending in the branch
    pub block: BlockId,
    /// The `Branch` instruction
    pub branch: InstId,
    /// Test the opposite of the branch condition
    pub negated: bool,
}

impl Condition {
    pub fn negate(self) -> Self {
        Self {
            negated: !self.negated,
            ..self
        }
    }
}

/// One arm of a switch: every case value whose jump-table entry reaches `body`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchCase {
    pub values: Vec<u32>,
    pub body: Region,
}

/// Structured AST node.
///
/// # Region Kinds
/// - **Leaf**: the statements of one block
/// - **Sequence**: regions executed in order
/// - **IfThenElse**: two-way branch; `else_region` is `None` when one arm is empty
/// - **While**: `header` is the leaf of the exit test, evaluated before every iteration
/// - **DoWhile**: the condition belongs to the last block of `body`
/// - **Loop**: endless loop left through `Break`, `Goto` or a return
/// - **Switch**: jump-table dispatch on the block's selector
/// - **Break** / **Continue**: leave or restart the innermost loop
/// - **Goto**: jump to the labelled block
/// - **GotoUnknown**: jump whose target is not a block of the function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    Leaf(BlockId),
    Sequence(Vec<Region>),
    IfThenElse {
        cond: Condition,
        then_region: Box<Region>,
        else_region: Option<Box<Region>>,
    },
    While {
        cond: Condition,
        header: Box<Region>,
        body: Box<Region>,
    },
    DoWhile {
        body: Box<Region>,
        cond: Condition,
    },
    Loop {
        body: Box<Region>,
    },
    Switch {
        block: BlockId,
        cases: Vec<SwitchCase>,
    },
    Break,
    Continue,
    Goto(BlockId),
    GotoUnknown(Option<u64>),
}

impl Region {
    /// Sequence of `items`, with nested sequences flattened into it.
    pub fn sequence(items: Vec<Region>) -> Region {
        let mut flat: Vec<Region> = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Region::Sequence(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        Region::Sequence(flat)
    }

    /// Child regions in document order.
    pub fn children(&self) -> Vec<&Region> {
        match self {
            Region::Sequence(items) => items.iter().collect(),
            Region::IfThenElse { then_region, else_region, .. } => {
                let mut children = vec![then_region.as_ref()];
                if let Some(e) = else_region {
                    children.push(e.as_ref());
                }
                children
            }
            Region::While { header, body, .. } => vec![header.as_ref(), body.as_ref()],
            Region::DoWhile { body, .. } | Region::Loop { body } => vec![body.as_ref()],
            Region::Switch { cases, .. } => cases.iter().map(|c| &c.body).collect(),
            Region::Leaf(_)
            | Region::Break
            | Region::Continue
            | Region::Goto(_)
            | Region::GotoUnknown(_) => Vec::new(),
        }
    }

    /// Visit this region and every descendant, parents first.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Region)) {
        f(self);
        for child in self.children() {
            child.walk(f);
        }
    }

    /// Blocks of every leaf, in document order.
    pub fn leaves(&self) -> Vec<BlockId> {
        let mut leaves = Vec::new();
        self.walk(&mut |r| {
            if let Region::Leaf(b) = r {
                leaves.push(*b);
            }
        });
        leaves
    }

    /// Number of `Goto` and `GotoUnknown` nodes.
    pub fn goto_count(&self) -> usize {
        let mut count = 0usize;
        self.walk(&mut |r| {
            if matches!(r, Region::Goto(_) | Region::GotoUnknown(_)) {
                count += 1;
            }
        });
        count
    }

    /// Blocks targeted by a `Goto`, each once, in document order.
    pub fn goto_targets(&self) -> Vec<BlockId> {
        let mut targets: Vec<BlockId> = Vec::new();
        self.walk(&mut |r| {
            if let Region::Goto(b) = r {
                if !targets.contains(b) {
                    targets.push(*b);
                }
            }
        });
        targets
    }

    /// Control never continues past this node.
    #[inline]
    pub fn is_jump(&self) -> bool {
        matches!(
            self,
            Region::Break | Region::Continue | Region::Goto(_) | Region::GotoUnknown(_)
        )
    }

    /// Short tag used in logs and summaries.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Region::Leaf(_) => "leaf",
            Region::Sequence(_) => "sequence",
            Region::IfThenElse { .. } => "if",
            Region::While { .. } => "while",
            Region::DoWhile { .. } => "do-while",
            Region::Loop { .. } => "loop",
            Region::Switch { .. } => "switch",
            Region::Break => "break",
            Region::Continue => "continue",
            Region::Goto(_) => "goto",
            Region::GotoUnknown(_) => "goto-unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_flattens_nested_sequences() {
        let seq = Region::sequence(vec![
            Region::Leaf(BlockId(0)),
            Region::Sequence(vec![Region::Leaf(BlockId(1)), Region::Goto(BlockId(0))]),
            Region::Break,
        ]);
        match &seq {
            Region::Sequence(items) => assert_eq!(items.len(), 4),
            other => panic!("expected sequence, got {:?}", other),
        }
        assert_eq!(seq.leaves(), vec![BlockId(0), BlockId(1)]);
        assert_eq!(seq.goto_count(), 1);
        assert_eq!(seq.goto_targets(), vec![BlockId(0)]);
    }
}
