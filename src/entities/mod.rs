// Composite entities written to the map artifacts
//
// - School: one per UAI, directory base plus education side tables
// - Commune: one per INSEE code, political side tables

pub mod commune;
pub mod school;

pub use commune::{assemble_communes, index_by_code, Commune, CommuneTables};
pub use school::{
    apply_class_metrics, assemble_schools, Address, BacResults, BrevetResults, CampusPreference, Contact,
    Coordinates, Enrollment, ExamResults, IpsRecord, IpsValue, LanguageOffering, Mentions, School, SchoolTables,
};
