//! Rich diagnostic error types for the hlmrf inference engine.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes, help text, and source chains so users know exactly what
//! went wrong and how to fix it.
//!
//! Non-convergence is not an error: reasoners report it
//! through [`crate::reasoner::OptimizationReport`] and callers decide what to do.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the hlmrf engine.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text, source spans) through to the user.
#[derive(Debug, Error, Diagnostic)]
pub enum HlmrfError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Grounding(#[from] GroundingError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Term(#[from] TermError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Reasoner(#[from] ReasonerError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Online(#[from] OnlineError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Model errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ModelError {
    #[error("unknown predicate: \"{name}\"")]
    #[diagnostic(
        code(hlmrf::model::unknown_predicate),
        help("Declare the predicate with `Model::add_predicate` before using it in rules or data.")
    )]
    UnknownPredicate { name: String },

    #[error("predicate \"{name}\" is already declared")]
    #[diagnostic(
        code(hlmrf::model::duplicate_predicate),
        help("Predicate names are unique within a model. Pick a different name.")
    )]
    DuplicatePredicate { name: String },

    #[error("predicate \"{predicate}\" takes {expected} arguments, got {actual}")]
    #[diagnostic(
        code(hlmrf::model::arity),
        help("Check the argument list of every atom using this predicate.")
    )]
    ArityMismatch {
        predicate: String,
        expected: usize,
        actual: usize,
    },

    #[error("invalid rule: {message}")]
    #[diagnostic(
        code(hlmrf::model::invalid_rule),
        help(
            "Logical rules need a conjunctive body and a disjunctive head; \
             arithmetic rules allow at most one summation variable per atom \
             and every variable must be bound by a positive body atom."
        )
    )]
    InvalidRule { message: String },

    #[error("unknown rule: {rule}")]
    #[diagnostic(
        code(hlmrf::model::unknown_rule),
        help("The rule id does not belong to this model. It may have been deleted.")
    )]
    UnknownRule { rule: u32 },

    #[error("failed to parse model document: {message}")]
    #[diagnostic(
        code(hlmrf::model::parse),
        help("Model documents are JSON with `predicates` and `rules` arrays.")
    )]
    Parse { message: String },
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum DatabaseError {
    #[error("truth value {value} for {atom} is outside [0, 1]")]
    #[diagnostic(
        code(hlmrf::database::value_range),
        help("Truth values are continuous in the closed interval [0, 1].")
    )]
    ValueOutOfRange { atom: String, value: f32 },

    #[error("atom {atom} is not present in any partition")]
    #[diagnostic(
        code(hlmrf::database::missing_atom),
        help("Add the atom with `Database::insert` (or the ADD online command) first.")
    )]
    MissingAtom { atom: String },

    #[error("failed to read fact file {path}")]
    #[diagnostic(
        code(hlmrf::database::read),
        help("Fact files are tab-separated: `Predicate<TAB>arg...<TAB>[value]`.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed fact at {path}:{line}: {message}")]
    #[diagnostic(
        code(hlmrf::database::malformed),
        help("Each line names a predicate, its arguments and an optional truth value.")
    )]
    Malformed {
        path: String,
        line: usize,
        message: String,
    },

    #[error("redb error: {message}")]
    #[diagnostic(
        code(hlmrf::database::redb),
        help(
            "The durable fact store encountered a transaction error. \
             Try again with a fresh database file."
        )
    )]
    Redb { message: String },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(hlmrf::database::serde),
        help("Persisted facts could not be decoded. The file may come from another version.")
    )]
    Serialization { message: String },
}

// ---------------------------------------------------------------------------
// Grounding errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum GroundingError {
    #[error("variable {variable} is not bound by any query atom")]
    #[diagnostic(
        code(hlmrf::grounding::unbound),
        help("Every variable must appear in a positive body atom or be a summation variable.")
    )]
    UnboundVariable { variable: String },

    #[error("unsupported formula in rule {rule}: {message}")]
    #[diagnostic(
        code(hlmrf::grounding::unsupported_formula),
        help("Only conjunctive queries with equality and inequality filters are supported.")
    )]
    UnsupportedFormula { rule: u32, message: String },
}

// ---------------------------------------------------------------------------
// Term errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum TermError {
    #[error("unsupported ground rule {ground_rule}: {reason}")]
    #[diagnostic(
        code(hlmrf::term::unsupported),
        help(
            "Terms are linear hyperplanes with an optional hinge and square. \
             Check the rule's coefficient expressions (division by a zero cardinality \
             produces a non-finite coefficient)."
        )
    )]
    UnsupportedShape { ground_rule: String, reason: String },

    #[error("rule {rule} has negative weight {weight}")]
    #[diagnostic(
        code(hlmrf::term::negative_weight),
        help(
            "A negative weight makes the objective non-convex. Enable \
             `generator.invert_negative_weights` to flip such rules automatically."
        )
    )]
    NegativeWeight { rule: u32, weight: f32 },

    #[error("hard constraint can never be satisfied: {ground_rule}")]
    #[diagnostic(
        code(hlmrf::term::infeasible),
        help("The observed data violates a hard constraint for every assignment of the targets.")
    )]
    InfeasibleConstraint { ground_rule: String },
}

// ---------------------------------------------------------------------------
// Term store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    #[diagnostic(
        code(hlmrf::store::io),
        help(
            "A term page could not be read or written. Check that the page directory \
             exists, has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(hlmrf::store::serde),
        help("A term page could not be encoded or decoded. The page file may be truncated.")
    )]
    Serialization { message: String },

    #[error("invalid page file {path}: {message}")]
    #[diagnostic(
        code(hlmrf::store::page),
        help("Page files are private to one store instance. Delete the page directory and re-ground.")
    )]
    InvalidPage { path: String, message: String },

    #[error("state snapshot does not match the store: {message}")]
    #[diagnostic(
        code(hlmrf::store::state_mismatch),
        help("Saved term state can only be loaded into the store (or a copy of it) that produced it.")
    )]
    StateMismatch { message: String },

    #[error("operation not supported by the {store} term store: {operation}")]
    #[diagnostic(
        code(hlmrf::store::unsupported),
        help("Use a term store variant that implements this operation.")
    )]
    Unsupported { store: String, operation: String },
}

// ---------------------------------------------------------------------------
// Reasoner errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ReasonerError {
    #[error("invalid reasoner configuration: {message}")]
    #[diagnostic(
        code(hlmrf::reasoner::invalid_config),
        help("Tolerances, step sizes and iteration counts must be positive.")
    )]
    InvalidConfig { message: String },

    #[error("the {reasoner} reasoner requires a {required} term store")]
    #[diagnostic(
        code(hlmrf::reasoner::store_mismatch),
        help("Select a matching `[term_store] kind` for this reasoner.")
    )]
    StoreMismatch { reasoner: String, required: String },

    #[error("failed to build thread pool: {message}")]
    #[diagnostic(
        code(hlmrf::reasoner::thread_pool),
        help("Lower `num_threads` or check process limits.")
    )]
    ThreadPool { message: String },
}

// ---------------------------------------------------------------------------
// Online protocol errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum OnlineError {
    #[error("unknown online command: \"{command}\"")]
    #[diagnostic(
        code(hlmrf::online::unknown_command),
        help("Known commands: ADD, DELETE, UPDATE, OBSERVE, QUERY, WRITE, SYNC, STOP, EXIT.")
    )]
    UnknownCommand { command: String },

    #[error("malformed {command} command: {message}")]
    #[diagnostic(
        code(hlmrf::online::malformed),
        help("Fields are tab separated. Values must parse as floats in [0, 1].")
    )]
    Malformed { command: String, message: String },
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config: {path}")]
    #[diagnostic(
        code(hlmrf::config::read),
        help("Ensure the config file exists and is readable.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    #[diagnostic(
        code(hlmrf::config::parse),
        help("Check the TOML syntax and the section names in the config file.")
    )]
    Parse { path: String, message: String },
}

/// Convenience result type for the hlmrf engine.
pub type HlmrfResult<T> = std::result::Result<T, HlmrfError>;
