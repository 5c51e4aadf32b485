//! Default content rules, disclosures and opt-out keywords.
//!
//! Tuned for Brazilian-Portuguese political campaign messaging. Every list
//! can be replaced through `compliance` configuration.

/// Provider hard ceiling on message size, in characters.
pub const MAX_MESSAGE_CHARS: usize = 4096;

/// Length text is cut to before the truncation marker is appended.
pub const TRUNCATE_TO_CHARS: usize = 4090;

/// Appended to truncated text. Six characters, so the result never exceeds
/// `MAX_MESSAGE_CHARS`.
pub const TRUNCATION_MARKER: &str = "\n[...]";

/// AI-generated content disclosure.
pub const AI_DISCLAIMER: &str =
    "\n\n_Mensagem gerada com auxílio de inteligência artificial._";

/// Presence of this token means the AI disclosure is already in the text.
pub const AI_DISCLAIMER_MARKER: &str = "inteligência artificial";

/// Legal identification footer. `{client_label}` is replaced by the sender.
pub const LEGAL_IDENTIFICATION_TEMPLATE: &str =
    "\n\nEnviado por {client_label} | Propaganda eleitoral - Res. TSE 23.610/2019";

/// Registration token that marks the footer as present.
pub const LEGAL_IDENTIFICATION_MARKER: &str = "Res. TSE 23.610/2019";

/// Placeholder substituted in the identification template.
pub const CLIENT_LABEL_PLACEHOLDER: &str = "{client_label}";

/// Hard-block patterns as `(name, regex)`. Matched case-insensitively.
pub const HARD_BLOCK_PATTERNS: &[(&str, &str)] = &[
    (
        "vote_buying",
        r"\b(compr|vend|pag|troc)(o|a|as|am|amos|ar|ando|ei|ou|uei)\s+(o\s+|seu\s+|teu\s+|de\s+)?votos?\b",
    ),
    (
        "vote_buying",
        r"\bvotos?\s+(em\s+troca|por\s+(dinheiro|cesta|pix|emprego))",
    ),
    (
        "vote_buying",
        r"\b(pix|dinheiro|cesta\s+b[aá]sica)\s+(pra|para|pelo|por)\s+(quem\s+)?vot",
    ),
    (
        "violent_threat",
        r"\b(vou|vamos|v[aã]o)\s+(te\s+|lhe\s+)?(matar|eliminar|quebrar)\b",
    ),
    ("violent_threat", r"\bameaça\s+de\s+morte\b"),
    ("violent_threat", r"\b(voc[eê]|tu)\s+vai\s+morrer\b"),
];

/// Terms that raise a review alert but do not block.
pub const SOFT_ALERT_TERMS: &[&str] = &[
    "garantido",
    "garantia de",
    "promessa",
    "prometo",
    "dinheiro",
    "pix",
    "emprego",
    "cesta básica",
    "fraude",
    "urna",
];

/// Whole-message opt-out keywords.
pub const OPT_OUT_KEYWORDS: &[&str] = &["sair", "parar", "cancelar", "stop", "unsubscribe"];
