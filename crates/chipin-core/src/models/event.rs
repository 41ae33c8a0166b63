use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSummary {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub organizer: Option<String>,
    #[serde(default)]
    pub participants_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDetail {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub event_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub required_participants: Option<u32>,
    // Decimal fields arrive as strings
    #[serde(default)]
    pub required_funds: Option<String>,
    #[serde(default)]
    pub total_collected: f64,
    #[serde(default)]
    pub participants: Vec<Participant>,
}

impl EventDetail {
    pub fn is_participant(&self, username: &str) -> bool {
        self.participants
            .iter()
            .any(|p| p.participant_username == username)
    }

    pub fn required_funds_value(&self) -> Option<f64> {
        self.required_funds.as_deref()?.trim().parse().ok()
    }

    /// Fraction of the funding goal collected so far, if there is a goal.
    pub fn funding_progress(&self) -> Option<f64> {
        match self.required_funds_value() {
            Some(goal) if goal > 0.0 => Some(self.total_collected / goal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: i64,
    pub participant_username: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub paid_amount: Option<String>,
}

impl Participant {
    pub fn paid_amount_value(&self) -> f64 {
        self.paid_amount
            .as_deref()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub title: String,
    pub description: Option<String>,
    pub location: String,
    pub event_time: DateTime<Utc>,
    pub required_participants: Option<u32>,
    pub required_funds: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusMessage {
    #[serde(default)]
    pub status: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event_detail() {
        let json = r#"{
            "id": 3,
            "title": "Picnic",
            "location": "Gorky Park",
            "required_funds": "5000.00",
            "total_collected": 1250,
            "participants": [
                {"id": 1, "participant_username": "ann", "status": "paid", "paid_amount": "1000.00"},
                {"id": 2, "participant_username": "bob", "status": "joined", "paid_amount": "250.00"}
            ]
        }"#;

        let event: EventDetail = serde_json::from_str(json).unwrap();
        assert_eq!(event.participants.len(), 2);
        assert!(event.is_participant("ann"));
        assert!(!event.is_participant("carol"));
        assert_eq!(event.required_funds_value(), Some(5000.0));
        assert_eq!(event.funding_progress(), Some(0.25));
        assert_eq!(event.participants[1].paid_amount_value(), 250.0);
    }

    #[test]
    fn test_funding_progress_without_goal() {
        let event: EventDetail =
            serde_json::from_str(r#"{"id": 1, "title": "Walk", "required_funds": null}"#).unwrap();
        assert_eq!(event.funding_progress(), None);
        assert!(event.participants.is_empty());
    }

    #[test]
    fn test_new_event_serializes_optional_fields_as_null() {
        let event = NewEvent {
            title: "Hike".to_string(),
            description: None,
            location: "Trailhead".to_string(),
            event_time: "2026-11-01T09:00:00Z".parse().unwrap(),
            required_participants: Some(4),
            required_funds: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_time"], "2026-11-01T09:00:00Z");
        assert!(json["description"].is_null());
        assert!(json["required_funds"].is_null());
        assert_eq!(json["required_participants"], 4);
    }
}
