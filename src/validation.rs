// ✅ Validation Suite - invariant checks over the published artifacts
// Critical violations fail the run; warnings are printed only.

use crate::artifact::read_json;
use crate::config::{BoundingBox, PipelineConfig};
use crate::election::{CandidateResult, ElectionResult};
use crate::entities::school::measured_class_size;
use crate::entities::{Commune, ExamResults, IpsValue, School};
use crate::pipeline::{COMMUNES_ARTIFACT, SCHOOLS_ARTIFACT};
use crate::reconciler::EntityKey;
use crate::rules::{SchoolRules, SchoolType};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

pub const IPS_RANGE: (f64, f64) = (30.0, 200.0);
pub const RUNOFF_PAIR_SUM: (f64, f64) = (99.0, 101.0);
pub const IPS_COVERAGE_MIN: f64 = 80.0;
pub const ENROLLMENT_COVERAGE_MIN: f64 = 40.0;

// ============================================================================
// VIOLATIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Critical, // artifact breaks a published invariant
    Warning,  // plausible but suspicious
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub severity: Severity,
    pub rule: String,
    pub entity_key: String,
    pub entity_name: String,
    pub message: String,
}

impl Violation {
    fn critical(rule: &str, key: &str, name: &str, message: String) -> Self {
        Violation {
            severity: Severity::Critical,
            rule: rule.to_string(),
            entity_key: key.to_string(),
            entity_name: name.to_string(),
            message,
        }
    }

    fn warning(rule: &str, key: &str, name: &str, message: String) -> Self {
        Violation {
            severity: Severity::Warning,
            ..Self::critical(rule, key, name, message)
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Critical => "CRITICAL",
            Severity::Warning => "WARNING",
        };
        write!(
            f,
            "[{}] {} {} ({}): {}",
            level, self.rule, self.entity_key, self.entity_name, self.message
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub schools_checked: usize,
    pub communes_checked: usize,
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    pub fn has_critical(&self) -> bool {
        self.violations.iter().any(|v| v.severity == Severity::Critical)
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.violations.iter().filter(|v| v.severity == severity).count()
    }

    /// Violation count per (severity, rule)
    pub fn counts_by_rule(&self) -> BTreeMap<(Severity, &str), usize> {
        let mut counts = BTreeMap::new();
        for v in &self.violations {
            *counts.entry((v.severity, v.rule.as_str())).or_default() += 1;
        }
        counts
    }

    pub fn summary(&self) -> String {
        format!(
            "{} schools, {} communes checked: {} critical, {} warnings",
            self.schools_checked,
            self.communes_checked,
            self.count(Severity::Critical),
            self.count(Severity::Warning)
        )
    }
}

// ============================================================================
// VALIDATOR
// ============================================================================

pub struct Validator {
    bounds: Vec<BoundingBox>,
    rules: SchoolRules,
}

/// Largest plausible head-count per level
pub fn max_students(school_type: SchoolType) -> i64 {
    match school_type {
        SchoolType::Primary => 800,
        SchoolType::MiddleSchool => 1500,
        _ => 2000,
    }
}

fn blank(year: &str) -> bool {
    year.trim().is_empty()
}

impl Validator {
    pub fn new(config: &PipelineConfig) -> Self {
        Validator {
            bounds: config.regions.iter().map(|r| r.bounds).collect(),
            rules: config.school_rules(),
        }
    }

    fn in_bounds(&self, latitude: f64, longitude: f64) -> bool {
        self.bounds.iter().any(|b| b.contains(latitude, longitude))
    }

    pub fn validate(&self, schools: &[School], communes: &BTreeMap<String, Commune>) -> ValidationReport {
        let mut violations = self.check_schools(schools);
        violations.extend(self.check_coverage(schools));
        violations.extend(self.check_communes(communes));
        violations.sort_by(|a, b| a.severity.cmp(&b.severity));

        ValidationReport {
            schools_checked: schools.len(),
            communes_checked: communes.len(),
            violations,
        }
    }

    pub fn check_schools(&self, schools: &[School]) -> Vec<Violation> {
        let mut out = Vec::new();
        let mut seen: BTreeSet<&str> = BTreeSet::new();

        for school in schools {
            let key = school.uai.as_str();
            let name = school.name.as_str();
            let critical = |rule: &str, message: String| Violation::critical(rule, key, name, message);

            if !school.school_type.is_known() {
                out.push(critical("school_type", "type is not one of Primaire, Collège, Lycée".to_string()));
            }

            let c = &school.coordinates;
            if !c.is_valid() {
                out.push(critical("coordinates", format!("invalid coordinates {}, {}", c.latitude, c.longitude)));
            } else if !self.in_bounds(c.latitude, c.longitude) {
                out.push(critical(
                    "coordinates",
                    format!("{}, {} outside every region", c.latitude, c.longitude),
                ));
            }

            if EntityKey::uai(key).as_ref().map(|k| k.as_str()) != Some(key) {
                out.push(critical("uai_format", format!("{:?} is not 7 digits and a letter", key)));
            }
            if !seen.insert(key) {
                out.push(critical("uai_unique", "UAI appears more than once".to_string()));
            }

            let mut missing_years = Vec::new();
            if school.ips.as_ref().is_some_and(|r| blank(&r.year)) {
                missing_years.push("ips");
            }
            if school.enrollment.as_ref().is_some_and(|r| blank(&r.year)) {
                missing_years.push("enrollment");
            }
            if school.exam_results.as_ref().is_some_and(|r| blank(r.year())) {
                missing_years.push("exam_results");
            }
            if school.languages.as_ref().is_some_and(|r| blank(&r.year)) {
                missing_years.push("languages");
            }
            for section in missing_years {
                out.push(critical("sub_record_year", format!("{} has no year", section)));
            }

            if let Some(enrollment) = &school.enrollment {
                if let (Some(students), Some(classes)) = (enrollment.student_count, enrollment.number_of_classes) {
                    if let Some(expected) = measured_class_size(students, classes) {
                        if school.class_size != Some(expected) {
                            out.push(critical(
                                "class_size",
                                format!("expected {} for {}/{}, found {:?}", expected, students, classes, school.class_size),
                            ));
                        }
                    }
                }

                if let Some(students) = enrollment.student_count {
                    let max = max_students(school.school_type);
                    if students > max {
                        out.push(Violation::warning(
                            "enrollment_plausible",
                            key,
                            name,
                            format!("{} students, above {} for a {}", students, max, school.school_type),
                        ));
                    }
                }
            }

            if school.school_type == SchoolType::HighSchool && self.rules.is_professional(name) {
                out.push(critical("professional_high_school", "professional high school in scope".to_string()));
            }

            if let Some(ips) = &school.ips {
                match &ips.value {
                    IpsValue::Score(v) if !(IPS_RANGE.0..=IPS_RANGE.1).contains(v) => {
                        out.push(critical("ips_range", format!("IPS {} outside [{}, {}]", v, IPS_RANGE.0, IPS_RANGE.1)));
                    }
                    IpsValue::Label(label) if label != "NS" => {
                        out.push(critical("ips_range", format!("unexpected IPS label {:?}", label)));
                    }
                    _ => {}
                }
            }

            if let Some(ExamResults::Brevet(b)) = &school.exam_results {
                if let Some(rate) = b.success_rate.filter(|r| !(0.0..=100.0).contains(r)) {
                    out.push(critical("percentage_range", format!("Brevet success rate {}", rate)));
                }
            }
        }

        out
    }

    pub fn check_coverage(&self, schools: &[School]) -> Vec<Violation> {
        if schools.is_empty() {
            return Vec::new();
        }
        let share = |n: usize| n as f64 / schools.len() as f64 * 100.0;
        let ips = share(schools.iter().filter(|s| s.ips.is_some()).count());
        let enrollment = share(schools.iter().filter(|s| s.enrollment.is_some()).count());

        let mut out = Vec::new();
        if ips < IPS_COVERAGE_MIN {
            out.push(Violation::warning(
                "ips_coverage",
                "*",
                "all schools",
                format!("IPS coverage {:.1}% below {}%", ips, IPS_COVERAGE_MIN),
            ));
        }
        if enrollment < ENROLLMENT_COVERAGE_MIN {
            out.push(Violation::warning(
                "enrollment_coverage",
                "*",
                "all schools",
                format!("enrollment coverage {:.1}% below {}%", enrollment, ENROLLMENT_COVERAGE_MIN),
            ));
        }
        out
    }

    pub fn check_communes(&self, communes: &BTreeMap<String, Commune>) -> Vec<Violation> {
        let mut out = Vec::new();

        for (key, commune) in communes {
            let name = commune.commune_name.as_str();
            let critical = |rule: &str, message: String| Violation::critical(rule, key, name, message);

            if EntityKey::insee(key).is_none() || commune.insee_code.as_str() != key {
                out.push(critical(
                    "insee_key",
                    format!("key {:?} does not match insee_code {:?}", key, commune.insee_code.as_str()),
                ));
            }

            if commune.mayor.as_ref().is_some_and(|m| blank(&m.year)) {
                out.push(critical("sub_record_year", "mayor has no year".to_string()));
            }

            if let Some(municipal) = &commune.municipal {
                if blank(&municipal.year) {
                    out.push(critical("sub_record_year", "municipal has no year".to_string()));
                }
                if !(0.0..=100.0).contains(&municipal.percentage) {
                    out.push(critical("percentage_range", format!("municipal winner at {}%", municipal.percentage)));
                }
            }

            if let Some(presidential) = &commune.presidential {
                out.extend(check_election("presidential", presidential, true).into_iter().map(|m| critical("election", m)));
            }
            if let Some(legislative) = &commune.legislative {
                // triangular runoffs exist, so no pair-sum rule
                out.extend(check_election("legislative", legislative, false).into_iter().map(|m| critical("election", m)));
            }
        }

        out
    }
}

fn sorted_by_percentage(candidates: &[CandidateResult]) -> bool {
    candidates.windows(2).all(|w| w[0].percentage >= w[1].percentage)
}

/// Problems of one election result, as messages
fn check_election(label: &str, result: &ElectionResult, pair_sum: bool) -> Vec<String> {
    let mut problems = Vec::new();

    if blank(&result.year) {
        problems.push(format!("{} has no year", label));
    }

    for (round, candidates, max) in [("round_1", &result.round_1, 4), ("round_2", &result.round_2, 2)] {
        if candidates.len() > max {
            problems.push(format!("{} {} lists {} candidates (max {})", label, round, candidates.len(), max));
        }
        if !sorted_by_percentage(candidates) {
            problems.push(format!("{} {} not sorted by percentage", label, round));
        }
        for c in candidates.iter().filter(|c| !(0.0..=100.0).contains(&c.percentage)) {
            problems.push(format!("{} {} {} at {}%", label, round, c.candidate, c.percentage));
        }
    }

    if pair_sum && result.round_2.len() == 2 {
        let sum: f64 = result.round_2.iter().map(|c| c.percentage).sum();
        if !(RUNOFF_PAIR_SUM.0..=RUNOFF_PAIR_SUM.1).contains(&sum) {
            problems.push(format!("{} runoff sums to {:.1}%", label, sum));
        }
    }

    problems
}

/// Read both artifacts from the data directory
pub fn load_artifacts(data_dir: &Path) -> Result<(Vec<School>, BTreeMap<String, Commune>)> {
    let schools_path = data_dir.join(SCHOOLS_ARTIFACT);
    let communes_path = data_dir.join(COMMUNES_ARTIFACT);

    let schools: Vec<School> = read_json(&schools_path)?
        .with_context(|| format!("Artifact not found: {}", schools_path.display()))?;
    let communes: BTreeMap<String, Commune> = read_json(&communes_path)?
        .with_context(|| format!("Artifact not found: {}", communes_path.display()))?;

    Ok((schools, communes))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Address, Contact, Coordinates, Enrollment, IpsRecord};

    fn school(uai: &str, school_type: SchoolType) -> School {
        School {
            uai: EntityKey::uai(uai).unwrap(),
            name: "Collège Test".to_string(),
            school_type,
            public_private: Some("Public".to_string()),
            address: Address::default(),
            coordinates: Coordinates {
                latitude: 47.2184,
                longitude: -1.5536,
            },
            contact: Contact::default(),
            student_count: None,
            ips: Some(IpsRecord {
                value: IpsValue::Score(104.2),
                year: "2023-2024".to_string(),
                ecart_type: None,
                national_average: None,
                academique_average: None,
                departemental_average: None,
            }),
            enrollment: Some(Enrollment {
                year: "2023-2024".to_string(),
                student_count: Some(250),
                number_of_classes: Some(10),
            }),
            class_size: Some(25.0),
            estimated_class_size: None,
            exam_results: None,
            languages: None,
            sources: Vec::new(),
        }
    }

    fn candidate(name: &str, pct: f64) -> CandidateResult {
        CandidateResult {
            candidate: name.to_string(),
            party: None,
            percentage: pct,
            votes: 0,
        }
    }

    fn commune(code: &str) -> Commune {
        Commune::new(EntityKey::insee(code).unwrap(), "Nantes".to_string())
    }

    fn validator() -> Validator {
        Validator::new(&PipelineConfig::default())
    }

    fn rules_of(violations: &[Violation]) -> Vec<&str> {
        violations.iter().map(|v| v.rule.as_str()).collect()
    }

    #[test]
    fn test_clean_school_passes() {
        let schools = vec![school("0440021J", SchoolType::MiddleSchool)];
        assert!(validator().check_schools(&schools).is_empty());
    }

    #[test]
    fn test_school_invariants() {
        let mut outside = school("0440021J", SchoolType::MiddleSchool);
        outside.coordinates = Coordinates {
            latitude: 48.8566,
            longitude: 2.3522,
        };
        let duplicate = school("0440021J", SchoolType::MiddleSchool);

        let mut wrong_size = school("0440022K", SchoolType::Primary);
        wrong_size.class_size = None;

        let mut bad_ips = school("0440023L", SchoolType::MiddleSchool);
        bad_ips.ips.as_mut().unwrap().value = IpsValue::Score(250.0);

        let mut no_year = school("0440024M", SchoolType::MiddleSchool);
        no_year.enrollment.as_mut().unwrap().year = String::new();

        let mut pro = school("0440025N", SchoolType::HighSchool);
        pro.name = "Lycée professionnel Leloup".to_string();

        let violations = validator().check_schools(&[outside, duplicate, wrong_size, bad_ips, no_year, pro]);
        let rules = rules_of(&violations);
        assert!(rules.contains(&"coordinates"));
        assert!(rules.contains(&"uai_unique"));
        assert!(rules.contains(&"class_size"));
        assert!(rules.contains(&"ips_range"));
        assert!(rules.contains(&"sub_record_year"));
        assert!(rules.contains(&"professional_high_school"));
        assert!(violations.iter().all(|v| v.severity == Severity::Critical));
    }

    #[test]
    fn test_ns_label_allowed() {
        let mut s = school("0440021J", SchoolType::MiddleSchool);
        s.ips.as_mut().unwrap().value = IpsValue::Label("NS".to_string());
        assert!(validator().check_schools(&[s]).is_empty());
    }

    #[test]
    fn test_plausibility_and_coverage_are_warnings() {
        let mut big = school("0440021J", SchoolType::Primary);
        big.enrollment = Some(Enrollment {
            year: "2023-2024".to_string(),
            student_count: Some(900),
            number_of_classes: Some(30),
        });
        big.class_size = Some(30.0);
        let mut bare = school("0440022K", SchoolType::Primary);
        bare.ips = None;
        bare.enrollment = None;
        bare.class_size = None;

        let mut other_bare = bare.clone();
        other_bare.uai = EntityKey::uai("0440023L").unwrap();

        let report = validator().validate(&[big, bare, other_bare], &BTreeMap::new());
        assert!(!report.has_critical(), "{:?}", report.violations);
        assert!(report.violations.iter().all(|v| v.severity == Severity::Warning));

        let counts = report.counts_by_rule();
        assert_eq!(counts[&(Severity::Warning, "enrollment_plausible")], 1);
        assert_eq!(counts[&(Severity::Warning, "ips_coverage")], 1);
        let rules = rules_of(&report.violations);
        assert!(rules.contains(&"enrollment_plausible"));
        assert!(rules.contains(&"ips_coverage"));
        assert!(rules.contains(&"enrollment_coverage"));
    }

    #[test]
    fn test_commune_checks() {
        let mut ok = commune("44109");
        ok.presidential = Some(ElectionResult {
            year: "2022".to_string(),
            round_1: vec![candidate("A", 30.0), candidate("B", 20.0)],
            round_2: vec![candidate("A", 58.0), candidate("B", 42.0)],
        });

        let mut bad = commune("85191");
        bad.presidential = Some(ElectionResult {
            year: "2022".to_string(),
            round_1: vec![candidate("A", 10.0), candidate("B", 20.0)],
            round_2: vec![candidate("A", 60.0), candidate("B", 30.0)],
        });

        let mut communes = BTreeMap::new();
        communes.insert("44109".to_string(), ok);
        communes.insert("85191".to_string(), bad);
        communes.insert("49007".to_string(), commune("49015"));

        let violations = validator().check_communes(&communes);
        let keys: BTreeSet<&str> = violations.iter().map(|v| v.entity_key.as_str()).collect();
        assert_eq!(keys, ["49007", "85191"].into_iter().collect());
        assert_eq!(violations.iter().filter(|v| v.entity_key == "85191").count(), 2);
    }

    #[test]
    fn test_legislative_triangular_runoff_allowed() {
        let mut c = commune("44109");
        c.legislative = Some(ElectionResult {
            year: "2024".to_string(),
            round_1: vec![candidate("A", 40.0)],
            round_2: vec![candidate("A", 45.0), candidate("B", 35.0)],
        });
        let mut communes = BTreeMap::new();
        communes.insert("44109".to_string(), c);
        assert!(validator().check_communes(&communes).is_empty());
    }
}
