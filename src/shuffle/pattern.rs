use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Suffixes every client treats as scratch files.
pub const TEMP_SUFFIXES: &[&str] = &[".tmp", ".temp", ".wbk"];

/// True when `name` follows a temporary-file naming convention.
pub fn is_temp_name(name: &str, extra_suffixes: &[String]) -> bool {
    let lower = name.to_lowercase();
    lower.starts_with('~')
        || TEMP_SUFFIXES.iter().any(|s| lower.ends_with(s))
        || extra_suffixes
            .iter()
            .any(|s| !s.is_empty() && lower.ends_with(&s.to_lowercase()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Slot {
    /// The user-visible file being saved.
    Target,
    Temp,
    Backup,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Target => write!(f, "target"),
            Slot::Temp => write!(f, "temp"),
            Slot::Backup => write!(f, "backup"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum NamePredicate {
    Any,
    TempConvention,
    /// `*` any run, `?` any one char, `#` one digit. Case-insensitive.
    Glob(String),
    /// A glob with `{name}`, `{stem}` and `{ext}` taken from the bound target.
    Derived(String),
}

impl fmt::Display for NamePredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamePredicate::Any => write!(f, "any name"),
            NamePredicate::TempConvention => write!(f, "temporary name"),
            NamePredicate::Glob(glob) => write!(f, "{glob}"),
            NamePredicate::Derived(template) => write!(f, "{template}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Literal(char),
    Star,
    One,
    Digit,
}

fn push_glob(tokens: &mut Vec<Token>, glob: &str) {
    for c in glob.chars() {
        tokens.push(match c {
            '*' => Token::Star,
            '?' => Token::One,
            '#' => Token::Digit,
            c => Token::Literal(c),
        });
    }
}

fn split_name(name: &str) -> (&str, &str) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, ext),
        _ => (name, ""),
    }
}

fn derive_tokens(template: &str, target: &str) -> Vec<Token> {
    let (stem, ext) = split_name(target);
    let mut tokens = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        push_glob(&mut tokens, &rest[..open]);
        let tail = &rest[open..];
        let (literal, consumed) = if tail.starts_with("{name}") {
            (target, 6)
        } else if tail.starts_with("{stem}") {
            (stem, 6)
        } else if tail.starts_with("{ext}") {
            (ext, 5)
        } else {
            tokens.push(Token::Literal('{'));
            rest = &tail[1..];
            continue;
        };
        tokens.extend(literal.chars().map(Token::Literal));
        rest = &tail[consumed..];
    }
    push_glob(&mut tokens, rest);
    tokens
}

fn chars_eq(a: char, b: char) -> bool {
    a == b || a.to_lowercase().eq(b.to_lowercase())
}

fn match_tokens(tokens: &[Token], name: &[char]) -> bool {
    // classic two-pointer wildcard match with single backtrack point
    let (mut t, mut n) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while n < name.len() {
        match tokens.get(t) {
            Some(Token::Star) => {
                star = Some((t, n));
                t += 1;
                continue;
            }
            Some(Token::One) => {
                t += 1;
                n += 1;
                continue;
            }
            Some(Token::Digit) if name[n].is_ascii_digit() => {
                t += 1;
                n += 1;
                continue;
            }
            Some(Token::Literal(c)) if chars_eq(*c, name[n]) => {
                t += 1;
                n += 1;
                continue;
            }
            _ => {}
        }
        match star {
            Some((st, sn)) => {
                t = st + 1;
                n = sn + 1;
                star = Some((st, sn + 1));
            }
            None => return false,
        }
    }
    tokens[t.min(tokens.len())..]
        .iter()
        .all(|token| *token == Token::Star)
}

fn token_weight(tokens: &[Token]) -> u32 {
    tokens
        .iter()
        .map(|t| match t {
            Token::Literal(_) => 2,
            Token::One | Token::Digit => 1,
            Token::Star => 0,
        })
        .sum()
}

impl NamePredicate {
    pub fn glob(pattern: &str) -> Self {
        NamePredicate::Glob(pattern.to_string())
    }

    pub fn derived(template: &str) -> Self {
        NamePredicate::Derived(template.to_string())
    }

    /// Whether `name` satisfies the predicate. A derived predicate with no
    /// bound target is accepted provisionally and re-checked once the target
    /// binds.
    pub fn matches(&self, name: &str, target: Option<&str>, extra_suffixes: &[String]) -> bool {
        let chars: Vec<char> = name.chars().collect();
        match self {
            NamePredicate::Any => true,
            NamePredicate::TempConvention => is_temp_name(name, extra_suffixes),
            NamePredicate::Glob(glob) => {
                let mut tokens = Vec::new();
                push_glob(&mut tokens, glob);
                match_tokens(&tokens, &chars)
            }
            NamePredicate::Derived(template) => match target {
                Some(target) => match_tokens(&derive_tokens(template, target), &chars),
                None => true,
            },
        }
    }

    pub fn is_derived(&self) -> bool {
        matches!(self, NamePredicate::Derived(_))
    }

    /// How constraining the predicate is; used to rank overlapping patterns.
    pub fn specificity(&self) -> u32 {
        match self {
            NamePredicate::Any => 0,
            NamePredicate::TempConvention => 1,
            NamePredicate::Glob(glob) => {
                let mut tokens = Vec::new();
                push_glob(&mut tokens, glob);
                token_weight(&tokens)
            }
            NamePredicate::Derived(template) => {
                let placeholders = ["{name}", "{stem}", "{ext}"]
                    .iter()
                    .map(|p| template.matches(p).count() as u32)
                    .sum::<u32>();
                let mut bare = template.to_string();
                for p in ["{name}", "{stem}", "{ext}"] {
                    bare = bare.replace(p, "");
                }
                let mut tokens = Vec::new();
                push_glob(&mut tokens, &bare);
                token_weight(&tokens) + 4 * placeholders
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepTemplate {
    Create(Slot),
    Rename { from: Slot, to: Slot },
    /// A rename refused because the destination name is taken.
    RenameFailed { from: Slot, to: Slot },
    Delete(Slot),
}

impl StepTemplate {
    fn slots(&self) -> Vec<Slot> {
        match *self {
            StepTemplate::Create(s) | StepTemplate::Delete(s) => vec![s],
            StepTemplate::Rename { from, to } | StepTemplate::RenameFailed { from, to } => {
                vec![from, to]
            }
        }
    }
}

impl fmt::Display for StepTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepTemplate::Create(s) => write!(f, "create {s}"),
            StepTemplate::Rename { from, to } => write!(f, "rename {from} -> {to}"),
            StepTemplate::RenameFailed { from, to } => write!(f, "rename {from} -> {to} (fails)"),
            StepTemplate::Delete(s) => write!(f, "delete {s}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepRole {
    Setup,
    /// The step on which the shuffle resolves.
    Commit,
    Cleanup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatternStep {
    pub template: StepTemplate,
    pub role: StepRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Carry {
    All,
    Only(Vec<String>),
    Nothing,
}

impl Carry {
    pub fn includes(&self, key: &str) -> bool {
        match self {
            Carry::All => true,
            Carry::Only(keys) => keys.iter().any(|k| k == key),
            Carry::Nothing => false,
        }
    }
}

/// What the surviving node keeps from the original.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataPolicy {
    pub carry_properties: Carry,
    pub carry_aspects: Carry,
    /// Create a version on the surviving node when it is versionable.
    pub version: bool,
}

impl Default for MetadataPolicy {
    fn default() -> Self {
        Self {
            carry_properties: Carry::All,
            carry_aspects: Carry::All,
            version: true,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    #[error("pattern {0}: no steps")]
    Empty(String),

    #[error("pattern {0}: expected exactly one commit step, found {1}")]
    CommitCount(String, usize),

    #[error("pattern {0}: commit step must land on the target")]
    CommitNotOnTarget(String),

    #[error("pattern {0}: cleanup steps must follow the commit step")]
    CleanupBeforeCommit(String),

    #[error("pattern {0}: slot {1} used without a predicate")]
    MissingPredicate(String, Slot),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShufflePattern {
    pub name: String,
    pub slots: Vec<(Slot, NamePredicate)>,
    pub steps: Vec<PatternStep>,
    pub policy: MetadataPolicy,
}

impl ShufflePattern {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            slots: vec![(Slot::Target, NamePredicate::Any)],
            steps: Vec::new(),
            policy: MetadataPolicy::default(),
        }
    }

    pub fn slot(mut self, slot: Slot, predicate: NamePredicate) -> Self {
        self.slots.retain(|(s, _)| *s != slot);
        self.slots.push((slot, predicate));
        self
    }

    pub fn setup(mut self, template: StepTemplate) -> Self {
        self.steps.push(PatternStep {
            template,
            role: StepRole::Setup,
        });
        self
    }

    pub fn commit(mut self, template: StepTemplate) -> Self {
        self.steps.push(PatternStep {
            template,
            role: StepRole::Commit,
        });
        self
    }

    pub fn cleanup(mut self, template: StepTemplate) -> Self {
        self.steps.push(PatternStep {
            template,
            role: StepRole::Cleanup,
        });
        self
    }

    pub fn policy(mut self, policy: MetadataPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn predicate(&self, slot: Slot) -> Option<&NamePredicate> {
        self.slots.iter().find(|(s, _)| *s == slot).map(|(_, p)| p)
    }

    pub fn commit_index(&self) -> Option<usize> {
        self.steps.iter().position(|s| s.role == StepRole::Commit)
    }

    pub fn validate(&self) -> Result<(), PatternError> {
        if self.steps.is_empty() {
            return Err(PatternError::Empty(self.name.clone()));
        }
        let commits = self
            .steps
            .iter()
            .filter(|s| s.role == StepRole::Commit)
            .count();
        if commits != 1 {
            return Err(PatternError::CommitCount(self.name.clone(), commits));
        }
        let commit = self.commit_index().unwrap_or_default();
        match self.steps[commit].template {
            StepTemplate::Create(Slot::Target)
            | StepTemplate::Rename {
                to: Slot::Target, ..
            } => {}
            _ => return Err(PatternError::CommitNotOnTarget(self.name.clone())),
        }
        if self.steps[..commit]
            .iter()
            .any(|s| s.role == StepRole::Cleanup)
        {
            return Err(PatternError::CleanupBeforeCommit(self.name.clone()));
        }
        for step in &self.steps {
            for slot in step.template.slots() {
                if self.predicate(slot).is_none() {
                    return Err(PatternError::MissingPredicate(self.name.clone(), slot));
                }
            }
        }
        Ok(())
    }
}

/// Ordered, validated set of patterns. Declaration order is the final
/// tie-break between equally specific matches.
#[derive(Debug, Clone)]
pub struct PatternTable {
    patterns: Vec<ShufflePattern>,
}

impl PatternTable {
    pub fn new(patterns: Vec<ShufflePattern>) -> Result<Self, PatternError> {
        for pattern in &patterns {
            pattern.validate()?;
        }
        Ok(Self { patterns })
    }

    pub fn builtin() -> Self {
        Self {
            patterns: builtin_patterns(),
        }
    }

    pub fn patterns(&self) -> &[ShufflePattern] {
        &self.patterns
    }

    pub fn get(&self, index: usize) -> Option<&ShufflePattern> {
        self.patterns.get(index)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

use self::Slot::{Backup, Target, Temp};
use self::StepTemplate::{Create, Delete, Rename, RenameFailed};

pub fn builtin_patterns() -> Vec<ShufflePattern> {
    vec![
        ShufflePattern::new("Word 2003")
            .slot(Temp, NamePredicate::glob("~WRD####.TMP"))
            .slot(Backup, NamePredicate::glob("~WRL####.TMP"))
            .setup(Create(Temp))
            .setup(Rename {
                from: Target,
                to: Backup,
            })
            .commit(Rename {
                from: Temp,
                to: Target,
            })
            .cleanup(Delete(Backup)),
        ShufflePattern::new("Word 2003 with backup")
            .slot(Temp, NamePredicate::glob("~WRD####.TMP"))
            .slot(Backup, NamePredicate::derived("Backup of {stem}*"))
            .setup(Create(Temp))
            .setup(Rename {
                from: Target,
                to: Backup,
            })
            .commit(Rename {
                from: Temp,
                to: Target,
            }),
        ShufflePattern::new("Word 2003 Save As")
            .slot(Temp, NamePredicate::glob("~WRD####.TMP"))
            .slot(Backup, NamePredicate::derived("{stem}.wbk"))
            .setup(Create(Temp))
            .setup(Rename {
                from: Target,
                to: Backup,
            })
            .commit(Rename {
                from: Temp,
                to: Target,
            }),
        ShufflePattern::new("Word 2007")
            .slot(Temp, NamePredicate::glob("*.tmp"))
            .slot(Backup, NamePredicate::glob("*.tmp"))
            .setup(Create(Temp))
            .setup(Rename {
                from: Target,
                to: Backup,
            })
            .commit(Rename {
                from: Temp,
                to: Target,
            })
            .cleanup(Delete(Backup)),
        ShufflePattern::new("Excel")
            .slot(Temp, NamePredicate::glob("????????"))
            .slot(Backup, NamePredicate::glob("????????.tmp"))
            .setup(Create(Temp))
            .setup(Rename {
                from: Target,
                to: Backup,
            })
            .commit(Rename {
                from: Temp,
                to: Target,
            })
            .cleanup(Delete(Backup)),
        ShufflePattern::new("FrameMaker")
            .slot(Temp, NamePredicate::derived("{name}.C*"))
            .slot(Backup, NamePredicate::derived("{stem}.backup.{ext}"))
            .setup(Create(Temp))
            .setup(Rename {
                from: Target,
                to: Backup,
            })
            .commit(Rename {
                from: Temp,
                to: Target,
            })
            .cleanup(Delete(Backup)),
        ShufflePattern::new("TextEdit")
            .slot(Temp, NamePredicate::derived("{name}.sb-*"))
            .setup(Create(Temp))
            .setup(Delete(Target))
            .commit(Rename {
                from: Temp,
                to: Target,
            }),
        ShufflePattern::new("gedit")
            .slot(Temp, NamePredicate::Any)
            .setup(RenameFailed {
                from: Temp,
                to: Target,
            })
            .setup(Delete(Target))
            .commit(Rename {
                from: Temp,
                to: Target,
            }),
        ShufflePattern::new("smultron")
            .slot(Temp, NamePredicate::glob(".dat*"))
            .setup(Create(Temp))
            .setup(Delete(Target))
            .commit(Rename {
                from: Temp,
                to: Target,
            }),
        ShufflePattern::new("vi")
            .slot(Backup, NamePredicate::derived("{name}~"))
            .setup(Rename {
                from: Target,
                to: Backup,
            })
            .commit(Create(Target))
            .cleanup(Delete(Backup)),
        ShufflePattern::new("emacs numbered backup")
            .slot(Backup, NamePredicate::derived("{name}.~#*~"))
            .setup(Rename {
                from: Target,
                to: Backup,
            })
            .commit(Create(Target)),
        ShufflePattern::new("generic temp swap")
            .slot(Temp, NamePredicate::TempConvention)
            .slot(Backup, NamePredicate::TempConvention)
            .setup(Rename {
                from: Target,
                to: Backup,
            })
            .commit(Rename {
                from: Temp,
                to: Target,
            })
            .cleanup(Delete(Backup)),
    ]
}
