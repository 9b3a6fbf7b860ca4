//! Terminal output formatter

use threadline_core::{Confidence, FinalResult};

pub fn format_results(results: &[FinalResult]) -> String {
    if results.is_empty() {
        return String::new();
    }

    let mut output = String::new();

    for result in results {
        let confidence = match result.confidence {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        };
        output.push_str(&format!(
            "== {} (confidence: {}, {} records analyzed)\n",
            result.source_id, confidence, result.records_analyzed
        ));
        output.push_str(&format!("{}\n", result.answer));
        if !result.citations.is_empty() {
            output.push_str(&format!("cited: {}\n", result.citations.join(", ")));
        }
        output.push('\n');
    }

    output
}
