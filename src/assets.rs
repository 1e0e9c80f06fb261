use rust_embed::RustEmbed;

/// SQL migrations compiled into the binary so a bare executable can
/// bootstrap its own schema.
#[derive(RustEmbed)]
#[folder = "migrations/"]
pub struct MigrationAssets;

impl MigrationAssets {
    /// Return all embedded migrations as `(file_name, sql)` pairs, ordered
    /// by file name (migrations are numbered `NNN_description.sql`).
    pub fn get_migrations() -> Vec<(String, String)> {
        let mut migrations: Vec<(String, String)> = Self::iter()
            .filter(|path| path.ends_with(".sql"))
            .filter_map(|path| {
                let file = Self::get(&path)?;
                let sql = String::from_utf8(file.data.into_owned()).ok()?;
                Some((path.to_string(), sql))
            })
            .collect();
        migrations.sort_by(|a, b| a.0.cmp(&b.0));
        migrations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_embedded_and_ordered() {
        let migrations = MigrationAssets::get_migrations();
        assert!(!migrations.is_empty());
        let names: Vec<&str> = migrations.iter().map(|(n, _)| n.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }
}
