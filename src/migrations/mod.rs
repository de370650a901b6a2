mod m0001_initial;
mod m0002_jobs;

use cetane::prelude::MigrationRegistry;

pub fn registry() -> MigrationRegistry {
    let mut reg = MigrationRegistry::new();
    reg.register(m0001_initial::migration());
    reg.register(m0002_jobs::migration());
    reg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_order() {
        let reg = registry();
        let order = reg.resolve_order().unwrap();
        assert_eq!(order, vec!["0001_initial", "0002_jobs"]);
    }
}
