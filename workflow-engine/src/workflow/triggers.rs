// Trigger Rules
// Decide whether a run context starts a workflow

use crate::execution::context::{RunContext, TriggerKind};

/// Rules from a workflow's `on` section. No rules means every trigger runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerRules {
    rules: Vec<TriggerRule>,
}

impl TriggerRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, rule: TriggerRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[TriggerRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// True if any rule accepts the context
    pub fn matches(&self, context: &RunContext) -> bool {
        self.rules.is_empty() || self.rules.iter().any(|rule| rule.matches(context))
    }
}

/// One event kind with optional branch and tag filters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRule {
    kind: TriggerKind,
    branches: Vec<String>,
    branches_ignore: Vec<String>,
    tags: Vec<String>,
    tags_ignore: Vec<String>,
}

impl TriggerRule {
    pub fn new(kind: TriggerKind) -> Self {
        Self {
            kind,
            branches: Vec::new(),
            branches_ignore: Vec::new(),
            tags: Vec::new(),
            tags_ignore: Vec::new(),
        }
    }

    pub fn branches<S: Into<String>>(mut self, patterns: impl IntoIterator<Item = S>) -> Self {
        self.branches.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn branches_ignore<S: Into<String>>(
        mut self,
        patterns: impl IntoIterator<Item = S>,
    ) -> Self {
        self.branches_ignore.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn tags<S: Into<String>>(mut self, patterns: impl IntoIterator<Item = S>) -> Self {
        self.tags.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn tags_ignore<S: Into<String>>(mut self, patterns: impl IntoIterator<Item = S>) -> Self {
        self.tags_ignore.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn kind(&self) -> TriggerKind {
        self.kind
    }

    fn filters_branches(&self) -> bool {
        !self.branches.is_empty() || !self.branches_ignore.is_empty()
    }

    fn filters_tags(&self) -> bool {
        !self.tags.is_empty() || !self.tags_ignore.is_empty()
    }

    /// A push rule with tag filters also accepts tag triggers. A rule that
    /// only filters tags never accepts a branch, and the reverse.
    pub fn matches(&self, context: &RunContext) -> bool {
        let trigger = context.trigger();
        let kind_matches = self.kind == trigger
            || (self.kind == TriggerKind::Push && trigger == TriggerKind::Tag && self.filters_tags());
        if !kind_matches {
            return false;
        }

        if let Some(branch) = context.branch() {
            if self.filters_tags() && !self.filters_branches() {
                return false;
            }
            filter(&self.branches, &self.branches_ignore, branch)
        } else if let Some(tag) = context.tag() {
            if self.filters_branches() && !self.filters_tags() {
                return false;
            }
            filter(&self.tags, &self.tags_ignore, tag)
        } else {
            true
        }
    }
}

fn filter(include: &[String], ignore: &[String], name: &str) -> bool {
    (include.is_empty() || include.iter().any(|p| glob_match(p, name)))
        && !ignore.iter().any(|p| glob_match(p, name))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    /// `*`
    Segment,
    /// `**`
    Any,
    /// `?`
    One,
    Literal(char),
}

fn tokenize(pattern: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        tokens.push(match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                Token::Any
            }
            '*' => Token::Segment,
            '?' => Token::One,
            c => Token::Literal(c),
        });
    }
    tokens
}

/// Ref glob: `*` matches within one path segment, `**` across segments,
/// `?` one character other than `/`.
///
/// Table-driven, linear in pattern length times text length.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let tokens = tokenize(pattern);
    let text: Vec<char> = text.chars().collect();

    // next[j]: tokens after the current one match text[j..]
    let mut next = vec![false; text.len() + 1];
    next[text.len()] = true;

    for token in tokens.iter().rev() {
        let mut row = vec![false; text.len() + 1];
        for j in (0..=text.len()).rev() {
            row[j] = match token {
                Token::Any => next[j] || (j < text.len() && row[j + 1]),
                Token::Segment => next[j] || (j < text.len() && text[j] != '/' && row[j + 1]),
                Token::One => j < text.len() && text[j] != '/' && next[j + 1],
                Token::Literal(c) => j < text.len() && text[j] == *c && next[j + 1],
            };
        }
        next = row;
    }

    next[0]
}
