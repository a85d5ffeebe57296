//! Prompts for page-by-page invoice extraction.
//!
//! The target invoices are Québec supplier invoices, so the prompts are in
//! French and name the two provincial/federal taxes (TPS, TVQ) explicitly.
//! Callers can override both the system prompt and the per-page
//! instruction via [`crate::config::ExtractionConfig`]; the constants here
//! are used only when no override is provided.

/// System prompt: the model is told pages arrive from last to first.
pub const DEFAULT_SYSTEM_PROMPT: &str = "Tu es un assistant IA qui permet d'extraire des informations des factures de la dernière page jusqu'à la première.";

/// Per-page instruction listing the header fields and line-item columns.
pub const DEFAULT_EXTRACTION_INSTRUCTION: &str = "Extraire les informations suivantes de la facture au format json: Fournisseur, Adresse du fournisseur, Numero de bon de commande, Numero de facture, Date (utiliser le format YYYY-MM-DD), Sous total, Taxes sur les produits et services (TPS), Taxe de vente provinciale (TVQ), Montant total. Pour chacune des lignes de la facture, extraire les informations suivantes: Quantité, Code de l'article, Description, Prix unitaire, Montant.";

/// Prefix of the carry-forward message.
pub const CARRY_FORWARD_PREFIX: &str = "Voici les informations extraites des pages analysées auparavant: ";

/// Frame the previous call's raw response as context for the next page.
///
/// The response is embedded verbatim so nothing extracted from later pages
/// is lost on the way to the first page.
pub fn carry_forward_context(previous_response: &str) -> String {
    format!("{CARRY_FORWARD_PREFIX}{previous_response}")
}

/// Schema reminder for providers without native structured outputs.
///
/// Appended to the system prompt so the reply is still a single JSON
/// object matching the extraction schema.
pub fn schema_instruction(schema_name: &str, schema_json: &str) -> String {
    format!(
        "\n\nRéponds uniquement avec un objet JSON valide conforme au schéma \"{schema_name}\" \
suivant, sans texte ni balises autour:\n{schema_json}"
    )
}
