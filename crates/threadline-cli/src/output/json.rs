//! JSON output formatter

use anyhow::Result;
use threadline_core::FinalResult;

pub fn format_results(results: &[FinalResult]) -> Result<String> {
    Ok(serde_json::to_string_pretty(results)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use threadline_core::Confidence;

    #[test]
    fn test_json_roundtrips() {
        let results = vec![FinalResult {
            source_id: "rust".to_string(),
            answer: "yes".to_string(),
            citations: vec!["p01".to_string()],
            confidence: Confidence::Medium,
            records_analyzed: 3,
        }];

        let json = format_results(&results).unwrap();
        let parsed: Vec<FinalResult> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].source_id, "rust");
        assert_eq!(parsed[0].confidence, Confidence::Medium);
    }
}
