use proptest::prelude::*;
use rehome_engine::config::parser;
use rehome_engine::config::validator;
use rehome_engine::layout::PathResolver;
use rehome_types::RecordId;

fn job_yaml(min_hold: u64, max_hold: u64, auth: &str, cleanup: &str) -> String {
    format!(
        r#"
version: "1.0"
job:
  name: prop_job
  min_hold_secs: {min_hold}
  max_hold_secs: {max_hold}
origin:
  host: old.example.com
  user: mover
  {auth}
destination:
  host: new.example.com
  user: mover
  password: secret
  base_dir: /organized
cleanup:
{cleanup}
state:
  backend: sqlite
"#
    )
}

proptest! {
    #[test]
    fn min_hold_must_not_exceed_max_hold(min_hold in 0_u64..7200, max_hold in 1_u64..7200) {
        let yaml = job_yaml(min_hold, max_hold, "password: secret", "  enabled: false");
        let config = parser::parse_job_str(&yaml).expect("generated yaml must parse");
        let result = validator::validate_job(&config);

        if min_hold > max_hold {
            prop_assert!(result.is_err());
        } else {
            prop_assert!(result.is_ok());
        }
    }

    #[test]
    fn exactly_one_credential_is_accepted(password in any::<bool>(), key in any::<bool>()) {
        let auth = match (password, key) {
            (true, true) => "password: secret\n  private_key: /keys/id_ed25519",
            (true, false) => "password: secret",
            (false, true) => "private_key: /keys/id_ed25519",
            (false, false) => "port: 22",
        };
        let yaml = job_yaml(60, 3600, auth, "  enabled: false");
        let config = parser::parse_job_str(&yaml).expect("generated yaml must parse");
        let result = validator::validate_job(&config);

        prop_assert_eq!(result.is_ok(), password != key);
    }

    #[test]
    fn disabled_cleanup_is_not_validated(enabled in any::<bool>(), workers in 0_usize..4) {
        let cleanup = format!("  enabled: {enabled}\n  workers: {workers}");
        let yaml = job_yaml(60, 3600, "password: secret", &cleanup);
        let config = parser::parse_job_str(&yaml).expect("generated yaml must parse");
        let result = validator::validate_job(&config);

        prop_assert_eq!(result.is_ok(), !enabled || workers > 0);
    }

    #[test]
    fn resolved_path_is_base_segments_then_name(
        identity in "[0-9a-f]{0,16}",
        depth in 0_usize..5,
        width in 1_usize..4,
        name in "[a-z]{1,8}\\.pdf",
    ) {
        let resolver = PathResolver::new(depth, width);
        let path = resolver.resolve(&RecordId::new(identity.clone()), "/organized/", &name);

        let rest = path.strip_prefix("/organized/").expect("base prefix");
        let parts: Vec<&str> = rest.split('/').collect();
        let (file, dirs) = parts.split_last().expect("file name");
        prop_assert_eq!(*file, name.as_str());
        prop_assert!(dirs.len() <= depth);
        prop_assert!(dirs.iter().all(|d| !d.is_empty() && d.len() <= width));
        prop_assert!(identity.starts_with(&dirs.concat()));
        if identity.len() >= depth * width {
            prop_assert_eq!(dirs.len(), depth);
        }
    }
}
