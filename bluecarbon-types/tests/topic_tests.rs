use bluecarbon_types::Topic;
use std::collections::HashMap;

#[test]
fn topic_new_trims_whitespace() {
    let topic = Topic::new("  projects ").unwrap();
    assert_eq!(topic.as_str(), "projects");
    assert_eq!(topic, Topic::projects());
}

#[test]
fn topic_rejects_empty_and_malformed_names() {
    assert!(Topic::new("").is_err());
    assert!(Topic::new("   ").is_err());
    assert!(Topic::new("field data").is_err());
    assert!(Topic::new("api/projects").is_err());
}

#[test]
fn topic_builtin_names() {
    assert_eq!(Topic::projects().as_str(), "projects");
    assert_eq!(Topic::carbon_credits().as_str(), "carbon_credits");
    assert_eq!(Topic::field_data().as_str(), "field_data");
    assert_eq!(Topic::system_status().as_str(), "system_status");
    assert_eq!(Topic::notifications().as_str(), "notifications");
}

#[test]
fn topic_serde_is_transparent() {
    let json = serde_json::to_string(&Topic::field_data()).unwrap();
    assert_eq!(json, "\"field_data\"");
    let parsed: Topic = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, Topic::field_data());
}

#[test]
fn topic_borrows_as_str_for_map_lookup() {
    let mut map = HashMap::new();
    map.insert(Topic::projects(), 1);
    assert_eq!(map.get("projects"), Some(&1));
}

#[test]
fn topic_from_str() {
    let topic: Topic = "carbon_credits".parse().unwrap();
    assert_eq!(topic, Topic::carbon_credits());
    assert!("".parse::<Topic>().is_err());
}
