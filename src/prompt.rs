// 🧾 Extraction Prompt
// System prompt for the vision model plus per-document-type focus hints

use crate::document::DocType;

const BASE_PROMPT: &str = r#"You are an expert underwriter and loan processor with advanced vision capabilities.
Your task is to extract ALL vital loan information from the provided document image.

CRITICAL INSTRUCTIONS:
1. Semantic mapping: the document may use different terminology than the target fields. Reason about context to match them.
   - "Note Rate" or "Interest" -> "Interest Rate"
   - "Creditor" or "Note Holder" -> "Lender / Creditor Name"
   - "Principal Amount" or "Amount Financed" -> "Loan Amount"
2. Blurry or small text: use context clues to infer words when text is pixelated.
3. Output format: return a JSON object with two keys:
   - "reasoning": a brief explanation of the document structure and any difficult mappings.
   - "data": an array of extracted fields.
4. Each item in "data" is an object with keys "field", "value", and "confidence" (0-1).

VITAL FIELDS TO EXTRACT:
- Borrower Name(s)
- Property Address (street, city, state, ZIP)
- Lender / Creditor Name
- Loan Number
- Loan Amount (Principal)
- Interest Rate (%)
- Interest Rate Type (Fixed, Adjustable/ARM)
- Loan Term (Months or Years)
- Amortization Type (Fixed, ARM, Balloon, etc.)
- Loan Purpose (Purchase, Refinance, Equity, etc.)
- Loan Type (Conventional, FHA, VA, USDA, etc.)
- Monthly Principal & Interest Payment
- Total Monthly Payment (if different)
- Origination / Closing Date
- Maturity Date
- Prepayment Penalty (Yes/No)
- Escrow / Impound Account (Yes/No)

If a field is NOT found, set value to "Not Found".
Format values cleanly (e.g., "$450,000.00", "6.5%", "360 Months")."#;

/// Fields worth prioritising for a given document type
pub fn focus_instructions(doc_type: DocType) -> Option<&'static str> {
    match doc_type {
        DocType::PayStub => Some(
            "Focus on extracting: Gross Pay, Net Pay, Pay Period Start/End, Employer Name, Employee Name, YTD Gross.",
        ),
        DocType::BankStatement => Some(
            "Focus on extracting: Account Holder, Bank Name, Account Number, Beginning Balance, Ending Balance, Statement Period.",
        ),
        DocType::TaxReturn => Some(
            "Focus on extracting: Tax Year, Filing Status, Total Income, Adjusted Gross Income (AGI), Wages/Salaries.",
        ),
        DocType::LoanApplication | DocType::Other => None,
    }
}

pub fn system_prompt(doc_type: DocType) -> String {
    let mut prompt = String::from(BASE_PROMPT);
    prompt.push_str("\n\nDOCUMENT TYPE CONTEXT:\n");
    prompt.push_str(&format!("The user has identified this document as a: **{}**.\n", doc_type));
    if let Some(focus) = focus_instructions(doc_type) {
        prompt.push_str(focus);
        prompt.push('\n');
    }
    prompt.push_str("Use this knowledge to prioritize relevant fields and interpret ambiguous values correctly.");
    prompt
}

pub fn user_text(doc_type: DocType) -> String {
    format!("Extract loan data from this {} image.", doc_type)
}
