use crate::models::{CallTurn, CallerIntent, ExtractedUtterance};
use crate::services::ai::{LlmProvider, Message};

const SYSTEM_PROMPT: &str = r#"You are the understanding engine behind a phone booking assistant. Analyze the caller's latest utterance in the context of the call transcript. The text comes from speech recognition, so tolerate fillers and transcription noise.

Return ONLY valid JSON (no markdown, no explanation) with this exact structure:
{
  "intent": "schedule|provide_info|confirm|decline|question|unknown",
  "service": "service the caller mentioned, or null",
  "customer_name": "caller's name if stated, or null",
  "date": "requested date as YYYY-MM-DD, or null",
  "weekday": "mon|tue|wed|thu|fri|sat|sun, or null",
  "bucket": "morning|afternoon|evening, or null",
  "time": "requested clock time as HH:MM (24h), or null",
  "confirmation": true, false, or null,
  "confidence": 0.0 to 1.0
}

Intent rules:
- "schedule": caller wants to book an appointment
- "provide_info": caller is answering a question (name, service, day, time)
- "confirm": caller accepts what was just offered (yes, sounds good, that works)
- "decline": caller rejects what was just offered (no, that doesn't work)
- "question": caller asks about hours, services, or prices
- "unknown": you cannot tell what the caller wants

Date rules:
- Resolve relative phrases ("tomorrow", "next Friday") to a concrete
  YYYY-MM-DD using the current date given in the business context.
- If the caller names only a weekday, fill "weekday" and leave "date" null.
- "morning"/"afternoon"/"evening" style phrases go in "bucket".

Set "confirmation" only when the caller is clearly accepting or rejecting
an offered time. Set "confidence" low when the utterance is garbled or
off-topic. Extract only what was said; never invent values."#;

pub async fn extract_utterance(
    llm: &dyn LlmProvider,
    turns: &[CallTurn],
    business_context: &str,
) -> anyhow::Result<ExtractedUtterance> {
    let messages: Vec<Message> = turns
        .iter()
        .map(|t| Message {
            role: t.role.clone(),
            content: t.text.clone(),
        })
        .collect();

    let system = format!("{SYSTEM_PROMPT}\n\nBusiness context:\n{business_context}");

    let response = llm.chat(&system, &messages).await?;

    Ok(parse_utterance_response(&response))
}

fn parse_utterance_response(response: &str) -> ExtractedUtterance {
    // Try direct parse first
    if let Ok(utterance) = serde_json::from_str::<ExtractedUtterance>(response) {
        return utterance;
    }

    // Strip markdown code fences
    let cleaned = response
        .trim()
        .strip_prefix("```json")
        .or_else(|| response.trim().strip_prefix("```"))
        .unwrap_or(response.trim());
    let cleaned = cleaned.strip_suffix("```").unwrap_or(cleaned).trim();

    if let Ok(utterance) = serde_json::from_str::<ExtractedUtterance>(cleaned) {
        return utterance;
    }

    // Try to find a JSON object in the response
    if let Some(start) = cleaned.find('{') {
        if let Some(end) = cleaned.rfind('}') {
            if let Ok(utterance) = serde_json::from_str::<ExtractedUtterance>(&cleaned[start..=end])
            {
                return utterance;
            }
        }
    }

    // Fallback: unclassifiable with zero confidence, so the engine re-asks
    tracing::warn!("failed to parse collaborator response as utterance JSON, using fallback");
    ExtractedUtterance {
        intent: CallerIntent::Unknown,
        confidence: 0.0,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_json() {
        let json = r#"{"intent":"schedule","service":"haircut","customer_name":"John","date":"2026-08-05","weekday":null,"bucket":"morning","time":null,"confirmation":null,"confidence":0.9}"#;
        let result = parse_utterance_response(json);
        assert_eq!(result.intent, CallerIntent::Schedule);
        assert_eq!(result.service.as_deref(), Some("haircut"));
        assert_eq!(result.date.as_deref(), Some("2026-08-05"));
        assert!(result.confidence > 0.8);
    }

    #[test]
    fn test_parse_markdown_fenced_json() {
        let fenced = "```json\n{\"intent\":\"confirm\",\"confirmation\":true,\"confidence\":0.95}\n```";
        let result = parse_utterance_response(fenced);
        assert_eq!(result.intent, CallerIntent::Confirm);
        assert_eq!(result.confirmation, Some(true));
    }

    #[test]
    fn test_parse_json_embedded_in_prose() {
        let noisy = "Here is the analysis: {\"intent\":\"decline\",\"confidence\":0.8} hope that helps";
        let result = parse_utterance_response(noisy);
        assert_eq!(result.intent, CallerIntent::Decline);
    }

    #[test]
    fn test_parse_fallback_is_unknown_with_zero_confidence() {
        let result = parse_utterance_response("I can't produce JSON right now");
        assert_eq!(result.intent, CallerIntent::Unknown);
        assert_eq!(result.confidence, 0.0);
    }
}
