use super::*;

#[test]
fn test_flag_values() {
    assert!(parse_flag("true"));
    assert!(parse_flag("1"));
    assert!(!parse_flag("TRUE"));
    assert!(!parse_flag("yes"));
    assert!(!parse_flag(""));
}

#[test]
fn test_health_port_falls_back_to_default() {
    assert_eq!(health_port(None), HEALTH_PORT);
    assert_eq!(health_port(Some("9090")), 9090);
    assert_eq!(health_port(Some("not-a-port")), HEALTH_PORT);
    assert_eq!(health_port(Some("70000")), HEALTH_PORT);
}

#[test]
fn test_empty_watch_namespace_means_all() {
    assert_eq!(watch_namespace(None), None);
    assert_eq!(watch_namespace(Some(String::new())), None);
    assert_eq!(
        watch_namespace(Some("monitoring".to_string())),
        Some("monitoring".to_string())
    );
}
