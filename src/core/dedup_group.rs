/*
 * A group of raw ingests that see overlapping copies of the same files (for
 * example the same night mirrored under two directory trees). Every file name
 * is ingested by at most one child: a child leaves a file alone when an
 * earlier sibling's to-do list already names it, or when a later sibling has
 * already completed it. A child's own completed files always stay with it.
 *
 * The decision reads the siblings' checkpoint files, so all children must be
 * prepped in declaration order before any of them runs. After that they can
 * run in any order.
 *
 * An earlier sibling claims only what its to-do list names. Files of exposures
 * it could not expand, or that were already in the store when it was prepped,
 * are not claimed, so a later copy of such a file is still ingested.
 */
use super::checkpoint::{CheckpointFiles, file_names};
use super::group::{cleanup_all, prep_all, print_group_status, run_all};
use super::operation::{Operation, OperationContext, OperationError, Result};
use super::raw_ingest::{FileClaimFilter, RawIngest};
use std::collections::BTreeSet;
use std::io::Write;

struct SiblingClaimFilter {
    own: String,
    earlier: Vec<String>,
    later: Vec<String>,
}

impl FileClaimFilter for SiblingClaimFilter {
    fn claimed_elsewhere(&self, ctx: &OperationContext) -> Result<BTreeSet<String>> {
        let own_completed =
            file_names(&CheckpointFiles::new(&ctx.work_dir, &self.own).read_completed()?);
        let mut claimed = BTreeSet::new();
        for sibling in &self.earlier {
            let todo = CheckpointFiles::new(&ctx.work_dir, sibling).read_todo()?;
            let Some(todo) = todo else {
                return Err(OperationError::NotReady(format!(
                    "{sibling} must be prepped before {}",
                    self.own
                )));
            };
            claimed.extend(
                file_names(&todo)
                    .into_iter()
                    .filter(|name| !own_completed.contains(name)),
            );
        }
        for sibling in &self.later {
            let completed = CheckpointFiles::new(&ctx.work_dir, sibling).read_completed()?;
            claimed.extend(file_names(&completed));
        }
        log::debug!(
            "DeduplicatingGroup: {} leaves {} file names to its siblings.",
            self.own,
            claimed.len()
        );
        Ok(claimed)
    }
}

pub struct DeduplicatingGroup {
    name: String,
    children: Vec<RawIngest>,
}

impl DeduplicatingGroup {
    pub fn new(name: impl Into<String>, mut children: Vec<RawIngest>) -> Self {
        let names: Vec<String> = children.iter().map(|c| c.name().to_string()).collect();
        for (i, child) in children.iter_mut().enumerate() {
            child.set_claim_filter(Box::new(SiblingClaimFilter {
                own: names[i].clone(),
                earlier: names[..i].to_vec(),
                later: names[i + 1..].to_vec(),
            }));
            child.set_require_prep(true);
        }
        DeduplicatingGroup {
            name: name.into(),
            children,
        }
    }

    fn child_ops(&self) -> impl Iterator<Item = &dyn Operation> {
        self.children.iter().map(|c| c as &dyn Operation)
    }
}

impl Operation for DeduplicatingGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn nested(&self) -> Vec<&dyn Operation> {
        self.child_ops().collect()
    }

    fn print_status(
        &self,
        ctx: &OperationContext,
        indent: usize,
        out: &mut dyn Write,
    ) -> Result<()> {
        print_group_status(&self.name, self.child_ops(), ctx, indent, out)
    }

    fn prep(&self, ctx: &OperationContext) -> Result<()> {
        prep_all(self.child_ops(), ctx)
    }

    fn run(&self, ctx: &OperationContext) -> Result<()> {
        run_all(self.child_ops(), ctx)
    }

    fn cleanup(&self, ctx: &OperationContext) -> Result<()> {
        cleanup_all(self.child_ops(), ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::exposure_finder::{ExposureId, FoundExposures};
    use crate::core::test_support::{FakeFinder, TestHarness, test_harness};
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn paths(items: &[&str]) -> Vec<PathBuf> {
        items.iter().map(PathBuf::from).collect()
    }

    fn set(items: &[&str]) -> BTreeSet<PathBuf> {
        items.iter().map(PathBuf::from).collect()
    }

    fn child(name: &str, id: ExposureId, dir: &str, files: &[&str]) -> RawIngest {
        let found: FoundExposures = [(id, PathBuf::from(dir))].into_iter().collect();
        RawIngest::new(
            name,
            Box::new(FakeFinder::new(found).with_files(id, &paths(files))),
            "HSC",
        )
    }

    /*
     * `exp1_det1.fits` exists under all three trees and `exp2_det0.fits`
     * under the second and third.
     */
    fn mirrored_group() -> DeduplicatingGroup {
        DeduplicatingGroup::new(
            "mirror",
            vec![
                child("a", 1, "/n1", &["/n1/exp1_det0.fits", "/n1/exp1_det1.fits"]),
                child("b", 2, "/n2", &["/n2/exp2_det0.fits", "/n2/exp1_det1.fits"]),
                child(
                    "c",
                    3,
                    "/n3",
                    &[
                        "/n3/exp3_det0.fits",
                        "/n3/exp1_det1.fits",
                        "/n3/exp2_det0.fits",
                    ],
                ),
            ],
        )
    }

    fn todo_of(h: &TestHarness, name: &str) -> Option<BTreeSet<PathBuf>> {
        CheckpointFiles::new(&h.ctx.work_dir, name).read_todo().unwrap()
    }

    #[test]
    fn test_duplicates_go_to_the_first_sibling() {
        let work = tempdir().unwrap();
        let h = test_harness(work.path());
        let group = mirrored_group();

        group.prep(&h.ctx).unwrap();

        assert_eq!(
            todo_of(&h, "a"),
            Some(set(&["/n1/exp1_det0.fits", "/n1/exp1_det1.fits"]))
        );
        assert_eq!(todo_of(&h, "b"), Some(set(&["/n2/exp2_det0.fits"])));
        assert_eq!(todo_of(&h, "c"), Some(set(&["/n3/exp3_det0.fits"])));

        let children = group.nested();
        children[2].run(&h.ctx).unwrap();
        children[1].run(&h.ctx).unwrap();
        children[0].run(&h.ctx).unwrap();

        assert_eq!(
            h.task.ingested_paths(),
            set(&[
                "/n1/exp1_det0.fits",
                "/n1/exp1_det1.fits",
                "/n2/exp2_det0.fits",
                "/n3/exp3_det0.fits",
            ])
        );
    }

    #[test]
    fn test_later_sibling_keeps_what_it_already_completed() {
        let work = tempdir().unwrap();
        let h = test_harness(work.path());
        let group = mirrored_group();
        // "b" ingested its copy before the group was set up.
        let b = CheckpointFiles::new(work.path(), "b");
        let mut log = b.begin_chunk().unwrap();
        log.record(&paths(&["/n2/exp1_det1.fits"])).unwrap();
        b.finish_chunk(log).unwrap();

        group.prep(&h.ctx).unwrap();

        assert_eq!(todo_of(&h, "a"), Some(set(&["/n1/exp1_det0.fits"])));
        assert_eq!(
            todo_of(&h, "b"),
            Some(set(&["/n2/exp1_det1.fits", "/n2/exp2_det0.fits"]))
        );
        assert_eq!(todo_of(&h, "c"), Some(set(&["/n3/exp3_det0.fits"])));
    }

    #[test]
    fn test_children_wait_for_earlier_preps() {
        let work = tempdir().unwrap();
        let h = test_harness(work.path());
        let group = mirrored_group();
        let children = group.nested();

        assert!(matches!(
            children[1].prep(&h.ctx),
            Err(OperationError::NotReady(_))
        ));
        assert!(matches!(
            children[0].run(&h.ctx),
            Err(OperationError::NotReady(_))
        ));
        assert!(todo_of(&h, "b").is_none());
        assert!(h.task.calls().is_empty());

        let mut out: Vec<u8> = Vec::new();
        group.print_status(&h.ctx, 0, &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "mirror:\n  a: interrupted; 1 exposures remaining, 0 files completed\n  \
             b: not started; 1 exposures remaining, 0 files completed\n  \
             c: not started; 1 exposures remaining, 0 files completed\n"
        );
    }

    #[test]
    fn test_files_an_earlier_sibling_cannot_expand_stay_with_later_siblings() {
        let work = tempdir().unwrap();
        let h = test_harness(work.path());
        let found = |dir: &str| -> FoundExposures { [(1, PathBuf::from(dir))].into_iter().collect() };
        let group = DeduplicatingGroup::new(
            "mirror",
            vec![
                RawIngest::new(
                    "a",
                    Box::new(
                        FakeFinder::new(found("/n1"))
                            .with_files(1, &paths(&["/n1/exp1_det0.fits"]))
                            .with_failing_expand(1),
                    ),
                    "HSC",
                ),
                child("b", 1, "/n2", &["/n2/exp1_det0.fits"]),
            ],
        );

        group.prep(&h.ctx).unwrap();

        assert_eq!(todo_of(&h, "a"), Some(BTreeSet::new()));
        assert_eq!(todo_of(&h, "b"), Some(set(&["/n2/exp1_det0.fits"])));

        group.run(&h.ctx).unwrap();

        assert_eq!(h.task.ingested_paths(), set(&["/n2/exp1_det0.fits"]));
    }
}
