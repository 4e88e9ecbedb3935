use std::fmt;
use std::rc::Rc;

/// A taint label. Labels are dense non-negative tags handed out
/// monotonically as bytes are labeled (byte-label mode), or the constant
/// `1` (binary mode).
pub type Label = u32;

/// A shared handle to an immutable label set.
///
/// The empty set is represented by the *absence* of a handle: shadow cells
/// store `Option<LabelSetRef>`, and an unoccupied cell means "no taint".
pub type LabelSetRef = Rc<LabelSet>;

/// A persistent set of labels with structural sharing.
///
/// Physically a binary tree: a leaf is a singleton, an interior node is the
/// union of its two (always non-empty) children. Sets are never mutated
/// after construction, so [`union`] can reference both inputs directly and
/// allocates at most one node. Reference counting frees a set bottom-up
/// once no shadow cell holds it.
#[derive(Debug, PartialEq, Eq)]
pub enum LabelSet {
    Singleton(Label),
    Union(LabelSetRef, LabelSetRef),
}

/// Creates the one-element set `{label}`.
pub fn singleton(label: Label) -> LabelSetRef {
    Rc::new(LabelSet::Singleton(label))
}

/// Set union.
///
/// `union(x, x) == x` and `union(x, ∅) == x` by pointer identity; only the
/// two-distinct-nonempty case allocates. Leaves are not deduplicated, so a
/// label reachable through both inputs is counted twice by
/// [`LabelSet::cardinality`].
pub fn union(a: Option<LabelSetRef>, b: Option<LabelSetRef>) -> Option<LabelSetRef> {
    match (a, b) {
        (Some(x), Some(y)) => {
            if Rc::ptr_eq(&x, &y) {
                Some(x)
            } else {
                Some(Rc::new(LabelSet::Union(x, y)))
            }
        }
        (Some(x), None) => Some(x),
        (None, y) => y,
    }
}

/// True iff `set` is the empty set.
pub fn is_empty(set: Option<&LabelSetRef>) -> bool {
    set.is_none()
}

/// Leaf count of `set`, zero for the empty set. See
/// [`LabelSet::cardinality`] for the upper-bound caveat.
pub fn cardinality(set: Option<&LabelSetRef>) -> u32 {
    set.map_or(0, |s| s.cardinality())
}

impl LabelSet {
    /// Visits every leaf, left child before right child.
    ///
    /// A label reachable through more than one union path is visited once
    /// per path.
    pub fn iterate(&self, f: &mut dyn FnMut(Label)) {
        let mut stack: Vec<&LabelSet> = vec![self];
        while let Some(node) = stack.pop() {
            match node {
                LabelSet::Singleton(l) => f(*l),
                LabelSet::Union(left, right) => {
                    stack.push(right);
                    stack.push(left);
                }
            }
        }
    }

    /// Number of leaves.
    ///
    /// Because [`union`] does not deduplicate, this is an upper bound on
    /// the number of distinct labels. Callers that need an exact count must
    /// deduplicate during [`LabelSet::iterate`].
    pub fn cardinality(&self) -> u32 {
        let mut n = 0;
        self.iterate(&mut |_| n += 1);
        n
    }

    /// True iff some leaf carries `label`.
    pub fn contains(&self, label: Label) -> bool {
        let mut found = false;
        self.iterate(&mut |l| found |= l == label);
        found
    }

    /// All leaves in visit order. Handy for tests and diagnostics; the hot
    /// paths use [`LabelSet::iterate`] directly.
    pub fn to_vec(&self) -> Vec<Label> {
        let mut out = Vec::new();
        self.iterate(&mut |l| out.push(l));
        out
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        let mut first = true;
        let mut err = Ok(());
        self.iterate(&mut |l| {
            if err.is_ok() {
                if !first {
                    err = write!(f, ", ");
                }
                if err.is_ok() {
                    err = write!(f, "{l}");
                }
                first = false;
            }
        });
        err?;
        write!(f, "}}")
    }
}
