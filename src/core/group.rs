/*
 * Composite operations. A `Group` owns an ordered, immutable list of child
 * operations and forwards `prep`, `run` and `cleanup` to each in declaration
 * order, stopping at the first error. The free functions below carry that
 * behaviour so that specialised groups (`RawIngestGroup`,
 * `DeduplicatingGroup`) share it.
 */
use super::operation::{Operation, OperationContext, OperationError, Result};
use std::io::Write;

pub struct Group {
    name: String,
    children: Vec<Box<dyn Operation>>,
}

impl Group {
    pub fn new(name: impl Into<String>, children: Vec<Box<dyn Operation>>) -> Self {
        Group {
            name: name.into(),
            children,
        }
    }

    pub fn children(&self) -> impl Iterator<Item = &dyn Operation> {
        self.children.iter().map(|c| c.as_ref())
    }
}

/*
 * Prints `{name}:` and then the status of each child indented two more
 * columns. A child that is blocked on an upstream step is reported as
 * `{child}: blocked; {reason}` instead of aborting the listing.
 */
pub fn print_group_status<'a>(
    name: &str,
    children: impl IntoIterator<Item = &'a dyn Operation>,
    ctx: &OperationContext,
    indent: usize,
    out: &mut dyn Write,
) -> Result<()> {
    writeln!(out, "{:indent$}{name}:", "")?;
    let child_indent = indent + 2;
    for child in children {
        match child.print_status(ctx, child_indent, out) {
            Ok(()) => {}
            Err(OperationError::NotReady(reason)) => {
                writeln!(
                    out,
                    "{:child_indent$}{}: blocked; {reason}",
                    "",
                    child.name()
                )?;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

pub fn prep_all<'a>(
    children: impl IntoIterator<Item = &'a dyn Operation>,
    ctx: &OperationContext,
) -> Result<()> {
    for child in children {
        log::debug!("Group: Preparing {}.", child.name());
        child.prep(ctx)?;
    }
    Ok(())
}

pub fn run_all<'a>(
    children: impl IntoIterator<Item = &'a dyn Operation>,
    ctx: &OperationContext,
) -> Result<()> {
    for child in children {
        log::info!("Group: Running {}.", child.name());
        child.run(ctx)?;
    }
    Ok(())
}

pub fn cleanup_all<'a>(
    children: impl IntoIterator<Item = &'a dyn Operation>,
    ctx: &OperationContext,
) -> Result<()> {
    for child in children {
        log::debug!("Group: Cleaning up {}.", child.name());
        child.cleanup(ctx)?;
    }
    Ok(())
}

impl Operation for Group {
    fn name(&self) -> &str {
        &self.name
    }

    fn nested(&self) -> Vec<&dyn Operation> {
        self.children().collect()
    }

    fn print_status(
        &self,
        ctx: &OperationContext,
        indent: usize,
        out: &mut dyn Write,
    ) -> Result<()> {
        print_group_status(&self.name, self.children(), ctx, indent, out)
    }

    fn prep(&self, ctx: &OperationContext) -> Result<()> {
        prep_all(self.children(), ctx)
    }

    fn run(&self, ctx: &OperationContext) -> Result<()> {
        run_all(self.children(), ctx)
    }

    fn cleanup(&self, ctx: &OperationContext) -> Result<()> {
        cleanup_all(self.children(), ctx)
    }
}
